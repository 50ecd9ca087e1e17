//! Broker client abstraction.
//!
//! The RPC runtime never speaks a wire protocol itself. It drives an existing broker client
//! through three traits that mirror the client's own object model:
//!
//! ```text
//! Broker ──connect──▶ BrokerConnection ──open_channel──▶ BrokerChannel
//!                          │                                  │
//!                          └──────── faults ──▶ FaultSink ◀───┘
//! ```
//!
//! Connection and channel failures are not returned from any call; the adapter pushes them
//! into the [`FaultSink`] it was handed when the link was created, and the owning session
//! decides whether to reconnect.
//!
//! # Implementations
//!
//! - `LapinBroker` (`brokered-rpc-amqp`) - AMQP 0-9-1 via `lapin`
//! - `InMemoryBroker` (`brokered-rpc-testing`) - exchange/binding routing in memory
//!
//! # Dyn Compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of using `async fn` so that the
//! runtime can hold `Arc<dyn Broker>` and swap adapters without generics leaking into every
//! component.

use crate::config::BrokerSettings;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by broker adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not establish or keep the connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Channel-level protocol fault
    #[error("Channel failed: {0}")]
    ChannelFailed(String),

    /// Exchange or queue declaration/binding was refused
    #[error("Declaration of '{target}' failed: {reason}")]
    DeclareFailed {
        /// Exchange or queue name
        target: String,
        /// The reason for failure
        reason: String,
    },

    /// A publish was rejected
    #[error("Publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    PublishFailed {
        /// Exchange published to
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Could not start consuming a queue
    #[error("Consume on queue '{queue}' failed: {reason}")]
    ConsumeFailed {
        /// Queue name
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// The session was closed locally while the operation was pending
    #[error("Session closed")]
    Closed,
}

/// A message as carried by the broker, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerMessage {
    /// Content-type property (`"<origin>|<method>"` for RPC traffic)
    pub content_type: Option<String>,
    /// Correlation-id property
    pub correlation_id: Option<String>,
    /// Raw body
    pub payload: Vec<u8>,
}

/// Asynchronous failure signalled by a connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFault {
    /// The connection was closed by the peer
    ConnectionClosed(String),
    /// The connection reported an error
    ConnectionError(String),
    /// The channel was closed by the peer
    ChannelClosed(String),
    /// The channel reported an error
    ChannelError(String),
}

impl LinkFault {
    /// Whether the fault originated on the channel rather than the connection.
    #[must_use]
    pub const fn is_channel(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::ChannelError(_))
    }

    /// Human readable reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::ConnectionClosed(reason)
            | Self::ConnectionError(reason)
            | Self::ChannelClosed(reason)
            | Self::ChannelError(reason) => reason,
        }
    }
}

/// Where adapters report [`LinkFault`]s.
///
/// Every sink is stamped with the generation of the link it was created for, so the session
/// can ignore late faults from a link it already replaced.
#[derive(Debug, Clone)]
pub struct FaultSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkFault)>,
}

impl FaultSink {
    /// Create a sink for the link `generation`.
    #[must_use]
    pub const fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkFault)>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the link this sink belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a fault. Silently ignored once the owning session is gone.
    pub fn report(&self, fault: LinkFault) {
        let _ = self.tx.send((self.generation, fault));
    }
}

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a consumed queue. Ends when the channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<BrokerMessage, BrokerError>> + Send>>;

/// Entry point of a broker client.
pub trait Broker: Send + Sync {
    /// Open a connection using `settings`.
    ///
    /// Connection-level faults raised later must be reported to `faults`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker is unreachable or refuses the
    /// credentials.
    fn connect<'a>(
        &'a self,
        settings: &'a BrokerSettings,
        faults: FaultSink,
    ) -> BrokerFuture<'a, Arc<dyn BrokerConnection>>;
}

/// An open broker connection.
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this connection.
    ///
    /// Channel-level faults raised later must be reported to `faults`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelFailed`] if the channel cannot be opened.
    fn open_channel(&self, faults: FaultSink) -> BrokerFuture<'_, Arc<dyn BrokerChannel>>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// An open broker channel.
pub trait BrokerChannel: Send + Sync {
    /// Declare a direct, non-durable exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] on refusal.
    fn declare_exchange<'a>(&'a self, exchange: &'a str) -> BrokerFuture<'a, ()>;

    /// Declare a non-durable queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] on refusal.
    fn declare_queue<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, ()>;

    /// Bind `queue` to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] on refusal.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Start consuming `queue` with automatic acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if the consumer cannot be registered.
    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str) -> BrokerFuture<'a, DeliveryStream>;

    /// Publish `message` to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker rejects the message.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        message: BrokerMessage,
    ) -> BrokerFuture<'a, ()>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelFailed`] if the close handshake fails.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn fault_sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = FaultSink::new(7, tx);

        sink.report(LinkFault::ChannelClosed("peer closed".into()));

        let (generation, fault) = rx.try_recv().unwrap();
        assert_eq!(generation, 7);
        assert!(fault.is_channel());
        assert_eq!(fault.reason(), "peer closed");
    }

    #[test]
    fn fault_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        FaultSink::new(1, tx).report(LinkFault::ConnectionClosed("gone".into()));
    }
}
