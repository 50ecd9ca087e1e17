//! AMQP 0-9-1 broker adapter for brokered RPC.
//!
//! This crate implements the [`Broker`] traits from `brokered-rpc-core` on top of
//! [`lapin`], so the runtime can talk to RabbitMQ (or any AMQP 0-9-1 broker).
//!
//! # Topology
//!
//! - Exchanges are declared `direct` and non-durable
//! - Queues are declared non-durable
//! - Consumers use automatic acknowledgement
//! - Publishes wait for the broker's confirmation when confirms are enabled on the channel
//!
//! # Faults
//!
//! lapin signals connection and channel failures through `on_error` callbacks. The adapter
//! forwards them to the [`FaultSink`] handed over by the session, which owns the decision to
//! reconnect. Consumer streams end when their channel goes away.
//!
//! # Example
//!
//! ```no_run
//! use brokered_rpc_amqp::LapinBroker;
//! use brokered_rpc_core::config::BrokerSettings;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = BrokerSettings::from_env()?;
//! let broker = Arc::new(LapinBroker::new());
//! # let _ = (settings, broker);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use brokered_rpc_core::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerFuture, BrokerMessage, DeliveryStream,
    FaultSink, LinkFault,
};
use brokered_rpc_core::config::BrokerSettings;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;

/// Reply code sent with a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Virtual host used for every connection.
const DEFAULT_VHOST: &str = "/";

/// Build the AMQP URI for `settings`.
///
/// Heartbeat is expressed in whole seconds and the connection timeout in milliseconds,
/// saturating at the protocol limits.
#[must_use]
pub fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password().to_string(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: DEFAULT_VHOST.to_string(),
        query: AMQPQueryString {
            heartbeat: Some(u16::try_from(settings.heartbeat.as_secs()).unwrap_or(u16::MAX)),
            connection_timeout: Some(u64::try_from(settings.connect_timeout.as_millis()).unwrap_or(u64::MAX)),
            ..AMQPQueryString::default()
        },
    }
}

/// [`Broker`] backed by lapin, using lapin's default connection properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

impl LapinBroker {
    /// Create the broker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Broker for LapinBroker {
    fn connect<'a>(
        &'a self,
        settings: &'a BrokerSettings,
        faults: FaultSink,
    ) -> BrokerFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            tracing::debug!(
                host = %settings.host,
                port = settings.port,
                generation = faults.generation(),
                "Opening AMQP connection"
            );

            let connection = Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

            connection.on_error(move |err| {
                tracing::warn!(error = %err, "AMQP connection error");
                faults.report(LinkFault::ConnectionError(err.to_string()));
            });

            Ok(Arc::new(LapinConnection { connection }) as Arc<dyn BrokerConnection>)
        })
    }
}

/// An open lapin connection.
pub struct LapinConnection {
    connection: Connection,
}

impl std::fmt::Debug for LapinConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapinConnection")
            .field("status", &self.connection.status().state())
            .finish()
    }
}

impl BrokerConnection for LapinConnection {
    fn open_channel(&self, faults: FaultSink) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BrokerError::ChannelFailed(e.to_string()))?;

            channel.on_error(move |err| {
                tracing::warn!(error = %err, "AMQP channel error");
                faults.report(LinkFault::ChannelError(err.to_string()));
            });

            Ok(Arc::new(LapinChannel { channel }) as Arc<dyn BrokerChannel>)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.connection.status().connected() {
                return Ok(());
            }
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))
        })
    }
}

/// An open lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

impl std::fmt::Debug for LapinChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapinChannel")
            .field("id", &self.channel.id())
            .finish()
    }
}

impl BrokerChannel for LapinChannel {
    fn declare_exchange<'a>(&'a self, exchange: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: false,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| declare_failed(exchange, &e))
        })
    }

    fn declare_queue<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: false,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|_| ())
                .map_err(|e| declare_failed(queue, &e))
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| declare_failed(queue, &e))
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    consumer_tag,
                    BasicConsumeOptions {
                        no_ack: true,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                })?;

            let queue = queue.to_string();
            let deliveries = consumer.map(move |delivery| {
                delivery
                    .map(|delivery| BrokerMessage {
                        content_type: short_string(delivery.properties.content_type()),
                        correlation_id: short_string(delivery.properties.correlation_id()),
                        payload: delivery.data,
                    })
                    .map_err(|e| BrokerError::ConsumeFailed {
                        queue: queue.clone(),
                        reason: e.to_string(),
                    })
            });

            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: BrokerMessage,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let failed = |reason: String| BrokerError::PublishFailed {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason,
            };

            let mut properties = BasicProperties::default();
            if let Some(content_type) = message.content_type {
                properties = properties.with_content_type(ShortString::from(content_type));
            }
            if let Some(correlation_id) = message.correlation_id {
                properties = properties.with_correlation_id(ShortString::from(correlation_id));
            }

            let confirm = self
                .channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
                .map_err(|e| failed(e.to_string()))?;

            let confirmation = confirm.await.map_err(|e| failed(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(failed("broker nacked the message".to_string()));
            }
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.channel.status().connected() {
                return Ok(());
            }
            self.channel
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| BrokerError::ChannelFailed(e.to_string()))
        })
    }
}

fn declare_failed(target: &str, err: &lapin::Error) -> BrokerError {
    BrokerError::DeclareFailed {
        target: target.to_string(),
        reason: err.to_string(),
    }
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|value| value.as_str().to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::time::Duration;

    fn settings() -> BrokerSettings {
        BrokerSettings::builder()
            .username("svc")
            .password("secret")
            .host("rabbit.internal")
            .port(5673)
            .exchange("rpc")
            .origin_tag("billing")
            .heartbeat(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn uri_carries_credentials_and_address() {
        let uri = amqp_uri(&settings());

        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.vhost, "/");
    }

    #[test]
    fn uri_carries_heartbeat_and_timeout() {
        let uri = amqp_uri(&settings());

        assert_eq!(uri.query.heartbeat, Some(30));
        assert_eq!(uri.query.connection_timeout, Some(5_000));
    }

    #[test]
    fn oversized_heartbeat_saturates() {
        let settings = BrokerSettings::builder()
            .username("svc")
            .password("secret")
            .host("localhost")
            .port(5672)
            .exchange("rpc")
            .origin_tag("billing")
            .heartbeat(Duration::from_secs(u64::from(u16::MAX) + 10))
            .build()
            .unwrap();

        assert_eq!(amqp_uri(&settings).query.heartbeat, Some(u16::MAX));
    }

    #[test]
    fn short_strings_convert() {
        assert_eq!(short_string(&Some(ShortString::from("a|b"))), Some("a|b".to_string()));
        assert_eq!(short_string(&None), None);
    }
}
