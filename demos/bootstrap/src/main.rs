//! Brokered RPC bootstrap
//!
//! Connects the configured domains to RabbitMQ, starts their response consumers and
//! publishers, and keeps them running until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Broker credentials and routing (see brokered_rpc_core::config)
//! export RABBITMQ_USER=... RABBITMQ_PASS=... RABBITMQ_HOSTNAME=localhost RABBITMQ_PORT=5672
//! export RABBITMQ_EXCHANGE=rpc RPC_ORIGIN=billing
//!
//! # Optional
//! export RPC_DOMAINS=sender,payments     # domains to bring up
//! export RPC_PROBE_DOMAIN=sender         # issue one call after startup
//! export RPC_PROBE_METHOD=send_email
//! export METRICS_ADDR=0.0.0.0:9090       # serve Prometheus metrics
//!
//! cargo run -p brokered-rpc-bootstrap
//! ```

use anyhow::Context;
use brokered_rpc_amqp::LapinBroker;
use brokered_rpc_core::domain::Domain;
use brokered_rpc_runtime::ProviderRegistry;
use brokered_rpc_runtime::metrics::MetricsServer;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DOMAINS: &str = "sender,payments";

fn configured_domains(value: Option<String>) -> Vec<Domain> {
    value
        .as_deref()
        .unwrap_or(DEFAULT_DOMAINS)
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Domain::from)
        .collect()
}

async fn probe(registry: &ProviderRegistry, domain: &str, method: &str) {
    let client = match registry.client(domain) {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(domain, error = %err, "Probe skipped");
            return;
        }
    };

    match client.call(method, &json!({})).await {
        Ok(response) => tracing::info!(domain, method, data = %response.data, "Probe answered"),
        Err(err) => tracing::warn!(domain, method, kind = err.kind(), error = %err, "Probe failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,brokered_rpc=debug,lapin=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting brokered RPC");

    let mut metrics = None;
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let addr: SocketAddr = addr.parse().context("METRICS_ADDR is not a socket address")?;
        let mut server = MetricsServer::new(addr);
        server.serve()?;
        metrics = Some(server);
    }

    let registry = ProviderRegistry::from_env(Arc::new(LapinBroker::new()))
        .context("broker configuration is incomplete")?;
    tracing::info!(settings = ?registry.settings(), "Configuration loaded");

    for domain in configured_domains(std::env::var("RPC_DOMAINS").ok()) {
        // A failed domain is reported by the registry and does not stop the others
        if let Err(err) = registry.start_listening(domain.clone()).await {
            tracing::error!(%domain, error = %err, "Domain failed to start listening");
            continue;
        }
        if let Err(err) = registry.start_publishing(domain.clone()).await {
            tracing::error!(%domain, error = %err, "Domain failed to start publishing");
            continue;
        }
        tracing::info!(%domain, "Domain ready");
    }

    if let (Ok(domain), Ok(method)) = (std::env::var("RPC_PROBE_DOMAIN"), std::env::var("RPC_PROBE_METHOD")) {
        probe(&registry, &domain, &method).await;
    }

    tracing::info!(domains = ?registry.domains(), "Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    registry.shutdown().await;
    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(bytes = rendered.len(), "Final metrics snapshot rendered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_domains_when_unset() {
        assert_eq!(
            configured_domains(None),
            vec![Domain::new("sender"), Domain::new("payments")]
        );
    }

    #[test]
    fn domains_are_trimmed_and_blank_entries_skipped() {
        assert_eq!(
            configured_domains(Some(" billing , ,audit".to_string())),
            vec![Domain::new("billing"), Domain::new("audit")]
        );
    }
}
