//! # Brokered RPC Core
//!
//! Core traits and types for synchronous-style remote procedure calls carried over an
//! asynchronous publish/subscribe message broker.
//!
//! This crate has no I/O of its own. It defines:
//!
//! - **Envelopes**: the request and response payloads and their wire mapping
//! - **Broker seam**: the [`broker::Broker`] trait family a broker client adapter implements
//! - **Configuration**: broker credentials and RPC tuning, validated before any network I/O
//! - **Domains**: the keys that select an isolated RPC bundle
//! - **Failure observation**: the hook invoked when a domain becomes permanently unavailable
//!
//! ## Wire Contract
//!
//! ```text
//! content-type   : "<origin>|<method>"
//! correlation-id : opaque token, copied verbatim from request to response
//! body           : JSON (request body, or {"method", "status", "data"} for responses)
//! ```
//!
//! ## Example
//!
//! ```
//! use brokered_rpc_core::envelope::{CorrelationId, Method, RequestEnvelope};
//! use serde_json::json;
//!
//! let request = RequestEnvelope::new(Method::READ_FILE, "storefront", json!({ "path": "/a" }));
//! let message = request.to_message(&CorrelationId::generate())?;
//!
//! assert_eq!(message.content_type.as_deref(), Some("storefront|read_file"));
//! # Ok::<(), serde_json::Error>(())
//! ```

pub mod broker;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod observer;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerMessage, FaultSink, LinkFault};
pub use config::{BrokerSettings, ConfigError, RpcSettings};
pub use domain::{Domain, DomainSpec};
pub use envelope::{CorrelationId, Method, RequestEnvelope, ResponseEnvelope, ResponseStatus};
pub use observer::{FailureObserver, FailurePath, FailureReport};

/// Environment module - injected dependencies that keep the runtime testable
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts wall-clock time for failure reports
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic reports
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
