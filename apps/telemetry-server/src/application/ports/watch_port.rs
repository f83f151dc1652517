//! Certificate Watch Port (Driven Port)
//!
//! Events a filesystem watcher delivers about the server credentials.

/// A change to the watched certificate or key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEvent {
    /// The file was written or replaced.
    Modified,
    /// The file was removed or renamed away.
    Removed,
}

/// Watcher failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    /// The watcher could not be created or attached to the path.
    #[error("failed to watch {path}: {reason}")]
    Setup {
        /// Watched path.
        path: String,
        /// Underlying error.
        reason: String,
    },

    /// The watcher reported an error while running.
    #[error("watcher error: {0}")]
    Backend(String),
}
