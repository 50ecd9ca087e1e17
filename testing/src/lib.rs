//! # Brokered RPC Testing
//!
//! Testing utilities for brokered RPC.
//!
//! This crate provides:
//! - [`InMemoryBroker`]: a routing broker behind the `Broker` trait, with scripted failures
//! - [`EchoResponder`]: a remote responder answering requests on a domain's queue
//! - Mock implementations of environment traits and of the failure observer
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use brokered_rpc_testing::{EchoResponder, InMemoryBroker};
//!
//! #[tokio::test]
//! async fn round_trip() {
//!     let broker = InMemoryBroker::new();
//!     let registry = ProviderRegistry::new(Arc::new(broker.clone()), settings(), RpcSettings::default())?;
//!     registry.start_listening("sender").await?;
//!     registry.start_publishing("sender").await?;
//!     let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), "rpc").spawn();
//!
//!     let response = registry.client("sender")?.call(Method::SEND_EMAIL, &json!({})).await?;
//!     assert!(response.is_ok());
//! }
//! ```

pub mod broker;
pub mod responder;

use brokered_rpc_core::config::BrokerSettings;
use brokered_rpc_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use brokered_rpc_core::observer::{FailureObserver, FailureReport};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::Notify;

    /// Fixed clock for deterministic failure reports
    ///
    /// # Example
    ///
    /// ```
    /// use brokered_rpc_testing::mocks::FixedClock;
    /// use brokered_rpc_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Failure observer that keeps every report.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingObserver {
        reports: Arc<Mutex<Vec<FailureReport>>>,
        notify: Arc<Notify>,
    }

    impl RecordingObserver {
        /// Create an empty observer
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reports received so far
        #[must_use]
        pub fn reports(&self) -> Vec<FailureReport> {
            self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Wait until at least `count` reports arrived
        pub async fn wait_for_reports(&self, count: usize) -> Vec<FailureReport> {
            loop {
                let notified = self.notify.notified();
                let reports = self.reports();
                if reports.len() >= count {
                    return reports;
                }
                notified.await;
            }
        }
    }

    impl FailureObserver for RecordingObserver {
        fn on_failure(&self, report: FailureReport) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.reports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(report);
                self.notify.notify_waiters();
            })
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use super::BrokerSettings;

    /// Exchange used by [`test_settings`].
    pub const TEST_EXCHANGE: &str = "rpc";

    /// Origin tag used by [`test_settings`].
    pub const TEST_ORIGIN: &str = "tests";

    /// Broker settings pointing at a local broker with guest credentials.
    ///
    /// # Panics
    ///
    /// Never; all required settings are present.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_settings() -> BrokerSettings {
        BrokerSettings::builder()
            .username("guest")
            .password("guest")
            .host("localhost")
            .port(5672)
            .exchange(TEST_EXCHANGE)
            .origin_tag(TEST_ORIGIN)
            .build()
            .expect("test settings are complete")
    }

    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honors `RUST_LOG`; safe to call from every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing strategies using proptest.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Method names as responders register them.
    pub fn method_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,23}"
    }

    /// Small JSON bodies.
    pub fn json_body() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,32}".prop_map(Value::from),
            ("[a-z]{1,8}", any::<i32>()).prop_map(|(key, value)| {
                let mut object = Map::new();
                object.insert(key, Value::from(value));
                Value::Object(object)
            }),
        ]
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, PublishedMessage};
pub use helpers::{TEST_EXCHANGE, TEST_ORIGIN, init_test_tracing, test_settings};
pub use mocks::{FixedClock, RecordingObserver, test_clock};
pub use responder::EchoResponder;
