//! Prometheus metrics for the RPC runtime.
//!
//! Every metric carries a `domain` label so that bundles can be told apart:
//! - Calls, failures by kind and end-to-end latency
//! - Publishes and deliveries, including dropped deliveries
//! - Session connect attempts, reconnects and fatal transitions
//!
//! # Example
//!
//! ```rust,no_run
//! use brokered_rpc_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use brokered_rpc_core::domain::Domain;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder with a scrape address.
///
/// [`MetricsServer::start`] installs the recorder only (render on demand);
/// [`MetricsServer::serve`] also exposes it over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint is advertised on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A second installation in the same process (e.g., across tests) is tolerated and
    /// leaves [`MetricsServer::handle`] empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match prometheus_builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `/metrics` over HTTP on [`MetricsServer::addr`].
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound or a recorder is already installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = prometheus_builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(_err) = exporter.await {
                // ExporterError implements neither Debug nor Display.
                tracing::error!(%addr, "Metrics listener stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(%addr, "Serving metrics");
        Ok(())
    }

    /// Address the server was created with.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder wasn't installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn prometheus_builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
fn register_metrics() {
    // Call Metrics
    describe_counter!("rpc_calls_total", "Total number of RPC calls started");
    describe_counter!(
        "rpc_call_failures_total",
        "Total number of RPC calls that returned an error, by kind"
    );
    describe_histogram!(
        "rpc_call_duration_seconds",
        "Time from call start to completion"
    );

    // Transport Metrics
    describe_counter!("rpc_publishes_total", "Total number of requests published");
    describe_histogram!(
        "rpc_publish_duration_seconds",
        "Time taken to publish a request, including the gate wait"
    );
    describe_counter!(
        "rpc_deliveries_total",
        "Total number of response deliveries consumed"
    );
    describe_counter!(
        "rpc_deliveries_dropped_total",
        "Total number of deliveries dropped (unknown id, missing id, late)"
    );

    // Session Metrics
    describe_counter!(
        "session_connect_attempts_total",
        "Total number of broker connection attempts"
    );
    describe_counter!(
        "session_reconnects_total",
        "Total number of reconnection routines started"
    );
    describe_counter!(
        "session_fatal_total",
        "Total number of sessions that exhausted their reconnection budget"
    );
    describe_gauge!(
        "session_connected",
        "Whether the domain session is connected (0 or 1)"
    );
}

/// Call metrics recorder.
pub struct RpcMetrics;

impl RpcMetrics {
    /// Record a call start.
    pub fn record_call(domain: &Domain) {
        counter!("rpc_calls_total", "domain" => domain.to_string()).increment(1);
    }

    /// Record a call completion.
    pub fn record_completion(domain: &Domain, duration: Duration) {
        histogram!("rpc_call_duration_seconds", "domain" => domain.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a failed call.
    pub fn record_failure(domain: &Domain, kind: &'static str) {
        counter!("rpc_call_failures_total", "domain" => domain.to_string(), "kind" => kind)
            .increment(1);
    }

    /// Record a publish.
    pub fn record_publish(domain: &Domain, duration: Duration) {
        counter!("rpc_publishes_total", "domain" => domain.to_string()).increment(1);
        histogram!("rpc_publish_duration_seconds", "domain" => domain.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a consumed delivery.
    pub fn record_delivery(domain: &Domain) {
        counter!("rpc_deliveries_total", "domain" => domain.to_string()).increment(1);
    }

    /// Record a dropped delivery.
    pub fn record_dropped(domain: &Domain, reason: &'static str) {
        counter!("rpc_deliveries_dropped_total", "domain" => domain.to_string(), "reason" => reason)
            .increment(1);
    }
}

/// Session metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a connection attempt.
    pub fn record_connect_attempt(domain: &Domain) {
        counter!("session_connect_attempts_total", "domain" => domain.to_string()).increment(1);
    }

    /// Record the start of a reconnection routine.
    pub fn record_reconnect(domain: &Domain) {
        counter!("session_reconnects_total", "domain" => domain.to_string()).increment(1);
    }

    /// Record a fatal session.
    pub fn record_fatal(domain: &Domain) {
        counter!("session_fatal_total", "domain" => domain.to_string()).increment(1);
    }

    /// Record connectivity.
    pub fn record_connected(domain: &Domain, connected: bool) {
        gauge!("session_connected", "domain" => domain.to_string())
            .set(if connected { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn recorded_metrics_are_rendered() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        let domain = Domain::new("sender");
        RpcMetrics::record_call(&domain);
        RpcMetrics::record_failure(&domain, "timeout");
        SessionMetrics::record_connect_attempt(&domain);

        // Another test may have installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("rpc_calls_total"));
            assert!(rendered.contains("rpc_call_failures_total"));
            assert!(rendered.contains("session_connect_attempts_total"));
        }
    }
}
