//! In-memory broker for fast, deterministic session and call tests.
//!
//! Implements the [`Broker`] trait family with direct-exchange routing:
//! a message published to `(exchange, routing_key)` lands on every queue bound under that
//! key. Queues hand messages to their consumers round-robin and buffer them while nobody
//! consumes.
//!
//! Beyond routing, the broker can be scripted:
//! - refuse connections ([`InMemoryBroker::set_reachable`], [`InMemoryBroker::fail_next_connects`])
//! - reject publishes ([`InMemoryBroker::fail_next_publishes`])
//! - slow publishes down ([`InMemoryBroker::set_publish_delay`])
//! - break the most recent link ([`InMemoryBroker::inject_connection_fault`],
//!   [`InMemoryBroker::inject_channel_fault`])
//!
//! and inspected ([`InMemoryBroker::published`], [`InMemoryBroker::connect_attempts`],
//! [`InMemoryBroker::max_in_flight_publishes`]).

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only panics on a poisoned lock

use async_stream::stream;
use brokered_rpc_core::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerFuture, BrokerMessage, DeliveryStream,
    FaultSink, LinkFault,
};
use brokered_rpc_core::config::BrokerSettings;
use futures::Stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Link id used by consumers that are not attached to any connection.
const DETACHED: u64 = 0;

/// A message as it was published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// The message
    pub message: BrokerMessage,
}

struct ConsumerSlot {
    link: u64,
    tx: mpsc::UnboundedSender<Result<BrokerMessage, BrokerError>>,
}

#[derive(Default)]
struct QueueState {
    buffered: VecDeque<BrokerMessage>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
}

impl QueueState {
    fn push(&mut self, message: BrokerMessage) {
        let mut message = message;
        while !self.consumers.is_empty() {
            let index = self.next % self.consumers.len();
            match self.consumers[index].tx.send(Ok(message)) {
                Ok(()) => {
                    self.next = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    message = returned.unwrap();
                }
            }
        }
        self.buffered.push_back(message);
    }

    fn drop_link(&mut self, link: u64) {
        self.consumers.retain(|slot| slot.link != link);
    }
}

struct LinkRecord {
    id: u64,
    open: bool,
    connection_faults: FaultSink,
    channel_faults: Vec<FaultSink>,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    failing_connects: usize,
    failing_publishes: usize,
    publish_delay: Duration,
    in_flight_publishes: usize,
    max_in_flight_publishes: usize,
    connect_attempts: usize,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), Vec<String>>,
    published: Vec<PublishedMessage>,
    links: Vec<LinkRecord>,
    next_link: u64,
}

impl State {
    fn route(&mut self, exchange: &str, routing_key: &str, message: &BrokerMessage) -> usize {
        let queues = self
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned()
            .unwrap_or_default();

        for queue in &queues {
            self.queues.entry(queue.clone()).or_default().push(message.clone());
        }
        queues.len()
    }

    fn close_link(&mut self, link: u64) {
        for queue in self.queues.values_mut() {
            queue.drop_link(link);
        }
        if let Some(record) = self.links.iter_mut().find(|record| record.id == link) {
            record.open = false;
        }
    }

    fn is_open(&self, link: u64) -> bool {
        self.links.iter().any(|record| record.id == link && record.open)
    }

    fn subscribe(&mut self, queue: &str, link: u64) -> mpsc::UnboundedReceiver<Result<BrokerMessage, BrokerError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.queues.entry(queue.to_string()).or_default();
        while let Some(message) = state.buffered.pop_front() {
            let _ = tx.send(Ok(message));
        }
        state.consumers.push(ConsumerSlot { link, tx });
        rx
    }
}

fn into_stream(
    mut rx: mpsc::UnboundedReceiver<Result<BrokerMessage, BrokerError>>,
) -> impl Stream<Item = Result<BrokerMessage, BrokerError>> + Send + 'static {
    stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    }
}

/// In-memory broker.
///
/// Cloning yields a handle to the same broker.
///
/// # Example
///
/// ```
/// use brokered_rpc_testing::InMemoryBroker;
///
/// let broker = InMemoryBroker::new();
/// broker.fail_next_connects(2);
/// assert_eq!(broker.connect_attempts(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Create a reachable, empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent connection attempt fail (`false`) or succeed (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().unreachable = !reachable;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().failing_connects = count;
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().failing_publishes = count;
    }

    /// Hold every subsequent publish for `delay` before it is routed.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.state.lock().unwrap().publish_delay = delay;
    }

    /// Largest number of publishes that were in progress at the same time.
    #[must_use]
    pub fn max_in_flight_publishes(&self) -> usize {
        self.state.lock().unwrap().max_in_flight_publishes
    }

    /// Connection attempts seen so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().unwrap().connect_attempts
    }

    /// Links (connection + channels) currently open.
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.state.lock().unwrap().links.iter().filter(|link| link.open).count()
    }

    /// Every message published through a channel, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().published.clone()
    }

    /// Messages published under `routing_key`.
    #[must_use]
    pub fn published_to(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|published| published.routing_key == routing_key)
            .collect()
    }

    /// Whether `exchange` was declared.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().unwrap().exchanges.contains(exchange)
    }

    /// Whether `queue` is bound to `exchange` under `routing_key`.
    #[must_use]
    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .is_some_and(|queues| queues.iter().any(|bound| bound == queue))
    }

    /// Messages waiting in `queue` for a consumer.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |state| state.buffered.len())
    }

    /// Route `message` as if a remote peer had published it. Returns the number of queues
    /// it reached.
    pub fn deliver(&self, exchange: &str, routing_key: &str, message: BrokerMessage) -> usize {
        self.state.lock().unwrap().route(exchange, routing_key, &message)
    }

    /// Consume `queue` outside of any connection, as a remote responder would.
    ///
    /// The queue is created if it does not exist yet.
    #[must_use]
    pub fn consume_queue(&self, queue: &str) -> impl Stream<Item = BrokerMessage> + Send + 'static {
        let mut rx = self.state.lock().unwrap().subscribe(queue, DETACHED);
        stream! {
            while let Some(item) = rx.recv().await {
                if let Ok(message) = item {
                    yield message;
                }
            }
        }
    }

    /// Close the most recent open connection as if the peer dropped it.
    ///
    /// Its consumers' streams end and a [`LinkFault::ConnectionClosed`] is reported.
    /// Returns `false` if no link is open.
    pub fn inject_connection_fault(&self, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some((id, sink)) = state
            .links
            .iter()
            .rev()
            .find(|link| link.open)
            .map(|link| (link.id, link.connection_faults.clone()))
        else {
            return false;
        };

        state.close_link(id);
        drop(state);
        sink.report(LinkFault::ConnectionClosed(reason.to_string()));
        true
    }

    /// Close the most recent open channel as if the peer closed it.
    ///
    /// Its consumers' streams end and a [`LinkFault::ChannelClosed`] is reported.
    /// Returns `false` if no link is open.
    pub fn inject_channel_fault(&self, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some((id, sinks)) = state
            .links
            .iter()
            .rev()
            .find(|link| link.open)
            .map(|link| (link.id, link.channel_faults.clone()))
        else {
            return false;
        };

        state.close_link(id);
        drop(state);
        for sink in sinks {
            sink.report(LinkFault::ChannelClosed(reason.to_string()));
        }
        true
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &state.exchanges)
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("published", &state.published.len())
            .field("connect_attempts", &state.connect_attempts)
            .finish_non_exhaustive()
    }
}

impl Broker for InMemoryBroker {
    fn connect<'a>(
        &'a self,
        settings: &'a BrokerSettings,
        faults: FaultSink,
    ) -> BrokerFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.connect_attempts += 1;

            if state.unreachable {
                return Err(BrokerError::ConnectionFailed(format!(
                    "{}:{} unreachable",
                    settings.host, settings.port
                )));
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BrokerError::ConnectionFailed("connection refused".to_string()));
            }

            state.next_link += 1;
            let id = state.next_link;
            state.links.push(LinkRecord {
                id,
                open: true,
                connection_faults: faults,
                channel_faults: Vec::new(),
            });

            let connection: Arc<dyn BrokerConnection> = Arc::new(InMemoryConnection {
                broker: self.clone(),
                link: id,
            });
            Ok(connection)
        })
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    link: u64,
}

impl BrokerConnection for InMemoryConnection {
    fn open_channel(&self, faults: FaultSink) -> BrokerFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            let Some(record) = state.links.iter_mut().find(|record| record.id == self.link && record.open) else {
                return Err(BrokerError::ChannelFailed("connection closed".to_string()));
            };
            record.channel_faults.push(faults);

            let channel: Arc<dyn BrokerChannel> = Arc::new(InMemoryChannel {
                broker: self.broker.clone(),
                link: self.link,
            });
            Ok(channel)
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.broker.state.lock().unwrap().close_link(self.link);
            Ok(())
        })
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    link: u64,
}

impl InMemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<(), BrokerError> {
        if state.is_open(self.link) {
            Ok(())
        } else {
            Err(BrokerError::ChannelFailed("channel closed".to_string()))
        }
    }
}

/// Counts a publish as in progress until dropped, even when the caller abandons it.
struct InFlightPublish<'a> {
    state: &'a Mutex<State>,
    delay: Duration,
}

impl<'a> InFlightPublish<'a> {
    fn enter(state: &'a Mutex<State>) -> Self {
        let mut guard = state.lock().unwrap();
        guard.in_flight_publishes += 1;
        guard.max_in_flight_publishes = guard.max_in_flight_publishes.max(guard.in_flight_publishes);
        let delay = guard.publish_delay;
        drop(guard);
        Self { state, delay }
    }
}

impl Drop for InFlightPublish<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.in_flight_publishes = state.in_flight_publishes.saturating_sub(1);
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_exchange<'a>(&'a self, exchange: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            state.exchanges.insert(exchange.to_string());
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        })
    }

    fn bind_queue<'a>(&'a self, queue: &'a str, exchange: &'a str, routing_key: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::DeclareFailed {
                    target: exchange.to_string(),
                    reason: "no such exchange".to_string(),
                });
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::DeclareFailed {
                    target: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            }

            let bound = state
                .bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default();
            if !bound.iter().any(|existing| existing == queue) {
                bound.push(queue.to_string());
            }
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str, _consumer_tag: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            }

            let rx = state.subscribe(queue, self.link);
            let stream: DeliveryStream = Box::pin(into_stream(rx));
            Ok(stream)
        })
    }

    fn publish<'a>(&'a self, exchange: &'a str, routing_key: &'a str, message: BrokerMessage) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let in_flight = InFlightPublish::enter(&self.broker.state);
            if !in_flight.delay.is_zero() {
                tokio::time::sleep(in_flight.delay).await;
            }

            let mut state = self.broker.state.lock().unwrap();
            self.ensure_open(&state)?;

            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "rejected".to_string(),
                });
            }
            if !state.exchanges.contains(exchange) {
                return Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "no such exchange".to_string(),
                });
            }

            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
            });
            state.route(exchange, routing_key, &message);
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            for queue in state.queues.values_mut() {
                queue.drop_link(self.link);
            }
            Ok(())
        })
    }
}
