//! Default failure observer.

use brokered_rpc_core::observer::{FailureObserver, FailureReport};
use std::future::Future;
use std::pin::Pin;

/// Logs failure reports at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureObserver;

impl FailureObserver for LoggingFailureObserver {
    fn on_failure(&self, report: FailureReport) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            tracing::error!(
                domain = %report.domain,
                path = %report.path,
                reason = %report.reason,
                occurred_at = %report.occurred_at,
                "Domain permanently unavailable"
            );
        })
    }
}
