//! Credential File Watcher
//!
//! Watches the directories holding the server certificate and key and
//! forwards the events that concern those two files. Watching directories
//! keeps the watch alive across atomic rename-into-place updates.
//!
//! A write to either file reports `Modified`. Only the certificate going
//! away reports `Removed`; a key that is deleted and written back shows up
//! as the write.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::application::ports::{CertEvent, WatchError};

/// Events buffered between the watcher thread and the consumer.
const EVENT_BUFFER: usize = 64;

/// Stream of certificate events.
pub type CertEvents = mpsc::Receiver<Result<CertEvent, WatchError>>;

/// Keeps the underlying watch registered. Dropping it ends the event stream.
pub struct CertWatcher {
    _watcher: RecommendedWatcher,
    cert: PathBuf,
    key: PathBuf,
}

impl CertWatcher {
    /// The watched certificate path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.cert
    }

    /// The watched private key path.
    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key
    }
}

impl std::fmt::Debug for CertWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertWatcher")
            .field("cert", &self.cert)
            .field("key", &self.key)
            .finish()
    }
}

/// Start watching the server certificate `cert` and its private `key`.
///
/// # Errors
///
/// Returns `WatchError::Setup` if either path has no parent directory or a
/// watch cannot be registered.
pub fn watch_credentials(cert: &Path, key: &Path) -> Result<(CertWatcher, CertEvents), WatchError> {
    let (cert_dir, cert) = resolve(cert)?;
    let (key_dir, key) = resolve(key)?;
    let setup = |path: &Path, reason: String| WatchError::Setup {
        path: path.display().to_string(),
        reason,
    };

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let (filter_cert, filter_key) = (cert.clone(), key.clone());
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let forwarded = match res {
            Ok(event) => match classify_credentials(&event, &filter_cert, &filter_key) {
                Some(cert_event) => Ok(cert_event),
                None => return,
            },
            Err(e) => Err(WatchError::Backend(e.to_string())),
        };
        // Receiver gone means nobody is interested anymore.
        let _ = tx.blocking_send(forwarded);
    })
    .map_err(|e| setup(&cert, e.to_string()))?;

    watcher
        .watch(&cert_dir, RecursiveMode::NonRecursive)
        .map_err(|e| setup(&cert, e.to_string()))?;
    if key_dir != cert_dir {
        watcher
            .watch(&key_dir, RecursiveMode::NonRecursive)
            .map_err(|e| setup(&key, e.to_string()))?;
    }

    tracing::info!(
        cert = %cert.display(),
        key = %key.display(),
        "Watching server credentials"
    );
    Ok((
        CertWatcher {
            _watcher: watcher,
            cert,
            key,
        },
        rx,
    ))
}

/// Canonical parent directory of `path` and `path` rebuilt under it.
fn resolve(path: &Path) -> Result<(PathBuf, PathBuf), WatchError> {
    let setup = |reason: String| WatchError::Setup {
        path: path.display().to_string(),
        reason,
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| setup("path has no file name".to_string()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = dir.canonicalize().map_err(|e| setup(e.to_string()))?;
    let target = dir.join(file_name);
    Ok((dir, target))
}

/// Map a raw filesystem event onto a credential event.
#[must_use]
pub fn classify_credentials(event: &Event, cert: &Path, key: &Path) -> Option<CertEvent> {
    classify(event, cert)
        .or_else(|| classify(event, key).filter(|e| *e == CertEvent::Modified))
}

/// Map a raw filesystem event onto a certificate event.
#[must_use]
pub fn classify(event: &Event, target: &Path) -> Option<CertEvent> {
    let is_target = |i: usize| event.paths.get(i).is_some_and(|p| p == target);
    if !event.paths.iter().any(|p| p == target) {
        return None;
    }

    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(
            ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(RenameMode::To),
        ) => Some(CertEvent::Modified),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths = [from, to]
            if is_target(1) {
                Some(CertEvent::Modified)
            } else {
                Some(CertEvent::Removed)
            }
        }
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(CertEvent::Removed)
        }
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
