//! Subscription Description
//!
//! Interprets the first `SubscribeRequest` of a stream into a
//! [`ParsedSubscription`]: the target named in the prefix, the ordered list
//! of requested paths, and the delivery mode.
//!
//! # Producer selection
//!
//! The producer kind is a pure function of target and mode:
//!
//! | target | mode | kind |
//! |---|---|---|
//! | `OTHERS` | any | [`ProducerKind::NonDb`] |
//! | `EVENTS` | STREAM | [`ProducerKind::Events`] |
//! | a recognized database | any | [`ProducerKind::Db`] |
//! | anything else | any | [`ProducerKind::Translation`] |

use std::fmt;

use crate::proto::{
    Path, SubscribeRequest, SubscriptionList, subscribe_request, subscription_list,
};

// =============================================================================
// Targets
// =============================================================================

/// Target served by the non-database producer.
pub const OTHERS_TARGET: &str = "OTHERS";

/// Target served by the event producer in STREAM mode.
pub const EVENTS_TARGET: &str = "EVENTS";

/// Database targets served by the database producer.
pub const DATABASE_TARGETS: &[&str] = &[
    "APPL_DB",
    "ASIC_DB",
    "COUNTERS_DB",
    "LOGLEVEL_DB",
    "CONFIG_DB",
    "PFC_WD_DB",
    "FLEX_COUNTER_DB",
    "STATE_DB",
    "SNMP_OVERLAY_DB",
    "EVENT_DB",
    "APPL_STATE_DB",
];

/// Check whether a target names a recognized database.
#[must_use]
pub fn is_database_target(target: &str) -> bool {
    DATABASE_TARGETS.contains(&target)
}

// =============================================================================
// Delivery Mode
// =============================================================================

/// How a session delivers data to its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Continuous push until the connection closes.
    Stream,
    /// One batch per client poll, plus an implicit first poll.
    Poll,
    /// A single batch, then the session ends.
    Once,
}

impl DeliveryMode {
    /// Convert the wire enum value into a delivery mode.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::UnknownMode`] for values outside the enum.
    pub fn from_wire(value: i32) -> Result<Self, SubscriptionError> {
        match subscription_list::Mode::try_from(value) {
            Ok(subscription_list::Mode::Stream) => Ok(Self::Stream),
            Ok(subscription_list::Mode::Poll) => Ok(Self::Poll),
            Ok(subscription_list::Mode::Once) => Ok(Self::Once),
            Err(_) => Err(SubscriptionError::UnknownMode(value)),
        }
    }

    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "STREAM",
            Self::Poll => "POLL",
            Self::Once => "ONCE",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Producer Kind
// =============================================================================

/// The family of data source that serves a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    /// Host statistics and other data not backed by a database.
    NonDb,
    /// Streamed event notifications.
    Events,
    /// Database tables.
    Db,
    /// Model-translated paths.
    Translation,
}

impl ProducerKind {
    /// Select the producer kind for a target and mode.
    #[must_use]
    pub fn select(target: &str, mode: DeliveryMode) -> Self {
        if target == OTHERS_TARGET {
            Self::NonDb
        } else if target == EVENTS_TARGET && mode == DeliveryMode::Stream {
            Self::Events
        } else if is_database_target(target) {
            Self::Db
        } else {
            Self::Translation
        }
    }

    /// Short name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NonDb => "non_db",
            Self::Events => "events",
            Self::Db => "db",
            Self::Translation => "translation",
        }
    }
}

// =============================================================================
// Parsed Subscription
// =============================================================================

/// The subscription a client asked for in its first request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSubscription {
    /// Target named by the prefix.
    pub target: String,
    /// Prefix applied to every path.
    pub prefix: Path,
    /// Requested paths, in request order.
    pub paths: Vec<Path>,
    /// Delivery mode.
    pub mode: DeliveryMode,
    /// The full list as received, for producer-specific options.
    pub list: SubscriptionList,
}

impl ParsedSubscription {
    /// Parse the first request of a stream.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::NotSubscriptionList`] if the request is not a subscribe
    /// - [`SubscriptionError::MissingPrefix`] / [`SubscriptionError::EmptyTarget`]
    ///   if no target is named
    /// - [`SubscriptionError::NoSubscription`] if the list is empty
    /// - [`SubscriptionError::UnknownMode`] if the mode is not a known value
    pub fn from_request(request: &SubscribeRequest) -> Result<Self, SubscriptionError> {
        let Some(subscribe_request::Request::Subscribe(list)) = &request.request else {
            return Err(SubscriptionError::NotSubscriptionList);
        };

        let prefix = list
            .prefix
            .clone()
            .ok_or(SubscriptionError::MissingPrefix)?;
        if prefix.target.is_empty() {
            return Err(SubscriptionError::EmptyTarget);
        }

        if list.subscription.is_empty() {
            return Err(SubscriptionError::NoSubscription);
        }
        let paths = list
            .subscription
            .iter()
            .map(|sub| sub.path.clone().unwrap_or_default())
            .collect();

        let mode = DeliveryMode::from_wire(list.mode)?;

        Ok(Self {
            target: prefix.target.clone(),
            prefix,
            paths,
            mode,
            list: list.clone(),
        })
    }

    /// The producer kind that serves this subscription.
    #[must_use]
    pub fn producer_kind(&self) -> ProducerKind {
        ProducerKind::select(&self.target, self.mode)
    }

    /// Canonical text of target, element names, and mode.
    ///
    /// Used as the stable part of an admission key: `OTHERS|proc|uptime|STREAM`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![self.target.clone()];
        for path in &self.paths {
            parts.extend(path_element_names(path));
        }
        parts.push(self.mode.as_str().to_string());
        parts.join("|")
    }
}

/// Element names of a path, preferring structured elems over legacy elements.
#[must_use]
pub fn path_element_names(path: &Path) -> Vec<String> {
    if path.elem.is_empty() {
        path.element.clone()
    } else {
        path.elem.iter().map(|e| e.name.clone()).collect()
    }
}

/// Render a path as a slash-separated string, e.g. `proc/uptime`.
#[must_use]
pub fn path_to_string(path: &Path) -> String {
    path_element_names(path).join("/")
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a first request cannot be turned into a subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The first request carried no subscription list.
    #[error("first message must be SubscriptionList")]
    NotSubscriptionList,
    /// The subscription list carried no prefix.
    #[error("no target specified in prefix")]
    MissingPrefix,
    /// The prefix named an empty target.
    #[error("empty target data not supported")]
    EmptyTarget,
    /// The subscription list had no entries.
    #[error("invalid subscription path: no subscription")]
    NoSubscription,
    /// The mode value is not STREAM, POLL, or ONCE.
    #[error("unknown subscription mode: {0}")]
    UnknownMode(i32),
}

// =============================================================================
// Tests
// =============================================================================
