//! Errors surfaced to RPC callers.

use brokered_rpc_core::config::ConfigError;
use brokered_rpc_core::domain::Domain;
use brokered_rpc_core::envelope::{CorrelationId, Method};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the RPC runtime.
///
/// The type is `Clone` because a single session failure is fanned out to every waiter in the
/// response table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Missing or invalid setting
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Broker unreachable, or the connection dropped and could not be re-established
    #[error("Connection to broker for domain '{domain}' failed: {reason}")]
    Connection {
        /// Affected domain
        domain: Domain,
        /// The reason for failure
        reason: String,
    },

    /// Channel-level fault
    #[error("Channel for domain '{domain}' failed: {reason}")]
    Channel {
        /// Affected domain
        domain: Domain,
        /// The reason for failure
        reason: String,
    },

    /// No response arrived in time
    #[error("Call to '{method}' ({correlation_id}) timed out after {after:?}")]
    Timeout {
        /// Method that was called
        method: Method,
        /// Correlation id of the call
        correlation_id: CorrelationId,
        /// How long the caller waited
        after: Duration,
    },

    /// The remote responder reported status `error`
    #[error("Remote method '{method}' failed: {message}")]
    Application {
        /// Method that was called
        method: Method,
        /// Message supplied by the responder
        message: String,
    },

    /// The correlation id is already outstanding
    #[error("Correlation id {0} is already outstanding")]
    DuplicateCorrelation(CorrelationId),

    /// A response for a known call could not be decoded
    #[error("Malformed response for {correlation_id}: {reason}")]
    MalformedResponse {
        /// Correlation id of the call
        correlation_id: CorrelationId,
        /// Decoder message
        reason: String,
    },

    /// The domain failed permanently and accepts no more calls
    #[error("Domain '{0}' is unavailable")]
    DomainUnavailable(Domain),

    /// The broker rejected the request
    #[error("Publishing '{method}' failed: {reason}")]
    Publish {
        /// Method that was called
        method: Method,
        /// The reason for failure
        reason: String,
    },

    /// Request body or response data could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RpcError {
    /// Short label used for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Channel { .. } => "channel",
            Self::Timeout { .. } => "timeout",
            Self::Application { .. } => "application",
            Self::DuplicateCorrelation(_) => "duplicate_correlation",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::DomainUnavailable(_) => "domain_unavailable",
            Self::Publish { .. } => "publish",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_convert_transparently() {
        let err: RpcError = ConfigError::Missing(vec!["RABBITMQ_USER".into()]).into();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("RABBITMQ_USER"));
    }

    #[test]
    fn timeout_names_the_method() {
        let err = RpcError::Timeout {
            method: Method::SAVE_FILE,
            correlation_id: CorrelationId::from("abc"),
            after: Duration::from_secs(2),
        };
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("save_file"));
    }
}
