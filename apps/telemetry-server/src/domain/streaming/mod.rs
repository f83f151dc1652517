//! Telemetry Values
//!
//! The unit of data a producer hands to a session, and its conversion into a
//! `SubscribeResponse`.

use chrono::Utc;

use super::queue::Prioritized;
use crate::proto::{
    Notification, Path, SubscribeResponse, TypedValue, Update, subscribe_response,
};

/// Queue priority of ordinary values.
pub const VALUE_PRIORITY: u32 = 1;

/// Queue priority of the end-of-batch marker; drains after every value.
pub const END_OF_BATCH_PRIORITY: u32 = 0;

/// A single telemetry value produced for a session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Value {
    /// Prefix shared by the update path.
    pub prefix: Option<Path>,
    /// Path of the update, relative to the prefix.
    pub path: Option<Path>,
    /// Collection time in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// The value itself.
    pub val: Option<TypedValue>,
    /// Marks the end of the initial data set.
    pub sync_response: bool,
    /// Unrecoverable producer error; ends the session when dequeued.
    pub fatal: Option<String>,
}

impl Value {
    /// A value update stamped with the current time.
    #[must_use]
    pub fn update(prefix: Option<Path>, path: Path, val: TypedValue) -> Self {
        Self {
            prefix,
            path: Some(path),
            timestamp: now_nanos(),
            val: Some(val),
            ..Default::default()
        }
    }

    /// A sync marker.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            timestamp: now_nanos(),
            sync_response: true,
            ..Default::default()
        }
    }

    /// A fatal error report.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            timestamp: now_nanos(),
            fatal: Some(message.into()),
            ..Default::default()
        }
    }

    /// Convert into a protocol response.
    ///
    /// # Errors
    ///
    /// Returns the fatal message if this value reports a producer failure.
    pub fn to_response(&self) -> Result<SubscribeResponse, FatalValue> {
        if let Some(message) = &self.fatal {
            return Err(FatalValue(message.clone()));
        }

        let response = if self.sync_response {
            subscribe_response::Response::SyncResponse(true)
        } else {
            subscribe_response::Response::Update(Notification {
                timestamp: self.timestamp,
                prefix: self.prefix.clone(),
                update: vec![Update {
                    path: self.path.clone(),
                    val: self.val.clone(),
                    duplicates: 0,
                }],
                ..Default::default()
            })
        };

        Ok(SubscribeResponse {
            response: Some(response),
        })
    }
}

/// A producer reported an unrecoverable error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fatal producer error: {0}")]
pub struct FatalValue(pub String);

/// What travels through a session's delivery queue.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryItem {
    /// A value to send.
    Value(Value),
    /// The single ONCE batch has been fully produced.
    EndOfBatch,
}

impl Prioritized for DeliveryItem {
    fn priority(&self) -> u32 {
        match self {
            Self::Value(_) => VALUE_PRIORITY,
            Self::EndOfBatch => END_OF_BATCH_PRIORITY,
        }
    }
}

impl From<Value> for DeliveryItem {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Current time in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
