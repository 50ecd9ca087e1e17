//! Failure observation hook.
//!
//! When a domain's listening or publishing path becomes permanently unavailable, the
//! runtime hands a [`FailureReport`] to the configured [`FailureObserver`]. How the report
//! reaches a human (email, pager, chat) is the observer's business.

use crate::domain::Domain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Which path of a domain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePath {
    /// Starting the response consumer failed
    Listening,
    /// Starting the request producer failed
    Publishing,
    /// An established session exhausted its reconnection budget
    Session,
}

impl fmt::Display for FailurePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening => f.write_str("listening"),
            Self::Publishing => f.write_str("publishing"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// Structured description of a permanent domain failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// The domain that became unusable
    pub domain: Domain,
    /// Which path failed
    pub path: FailurePath,
    /// Last error seen
    pub reason: String,
    /// When the failure was declared
    pub occurred_at: DateTime<Utc>,
}

/// Receives [`FailureReport`]s.
///
/// Invoked at most once per domain for the lifetime of the process.
pub trait FailureObserver: Send + Sync {
    /// Handle a failure report.
    fn on_failure(&self, report: FailureReport) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
