//! One broker connection plus one channel, kept alive for a domain.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ok──▶ Connected ◀──ok── Reconnecting
//!                              │                 │                  │  ▲
//!                              │ exhausted       └──── fault ───────┘  │
//!                              ▼                                       │
//!                            Fatal ◀──────────── exhausted ────────────┘
//!
//! any state ──stop──▶ Closed   (Fatal stays Fatal)
//! ```
//!
//! `Fatal` and `Closed` are terminal: once entered, no further transition is published.
//!
//! # Faults
//!
//! Every link (connection + channel) is stamped with a generation number. Adapters report
//! faults through a [`FaultSink`] carrying that generation; faults from a link that was
//! already replaced are ignored. A fault on the current link starts exactly one
//! reconnection routine.
//!
//! While a connect or reconnection routine is running, a fault is held back instead of
//! dropped: it may belong to the link that routine is installing. When the routine
//! settles, the held fault is checked again against the link that is now current.

use crate::error::RpcError;
use crate::metrics::SessionMetrics;
use crate::reconnect::{ReconnectPolicy, retry_connect};
use brokered_rpc_core::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, FaultSink, LinkFault};
use brokered_rpc_core::config::BrokerSettings;
use brokered_rpc_core::domain::{Domain, DomainSpec};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, watch};

/// Lifecycle state of a [`ChannelSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet
    Disconnected,
    /// First connection in progress
    Connecting,
    /// Connection and channel open, topology declared
    Connected,
    /// Link lost, reconnection routine running
    Reconnecting,
    /// Retry budget exhausted; no further attempts
    Fatal {
        /// Last connection error
        reason: String,
    },
    /// Stopped locally
    Closed,
}

impl SessionState {
    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Closed)
    }

    /// Whether a channel is available.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting => f.write_str("reconnecting"),
            Self::Fatal { .. } => f.write_str("fatal"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// A queue and the routing key it is bound under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name
    pub queue: String,
    /// Routing key on the exchange
    pub routing_key: String,
}

/// Exchange and queues declared on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Direct exchange
    pub exchange: String,
    /// Queues bound to the exchange
    pub queues: Vec<QueueBinding>,
}

impl Topology {
    /// Request and response queues of `spec`, bound to `exchange`.
    #[must_use]
    pub fn for_domain(exchange: impl Into<String>, spec: &DomainSpec) -> Self {
        Self {
            exchange: exchange.into(),
            queues: vec![
                QueueBinding {
                    queue: spec.request_queue.clone(),
                    routing_key: spec.request_routing_key(),
                },
                QueueBinding {
                    queue: spec.response_queue.clone(),
                    routing_key: spec.response_routing_key(),
                },
            ],
        }
    }
}

struct Link {
    generation: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Single-flight bookkeeping for connect and reconnection routines.
#[derive(Default)]
struct Recovery {
    running: bool,
    deferred: Option<(u64, LinkFault)>,
}

struct SessionInner {
    domain: Domain,
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
    topology: Topology,
    policy: ReconnectPolicy,
    state: watch::Sender<SessionState>,
    link: RwLock<Option<Link>>,
    generation: AtomicU64,
    faults_tx: mpsc::UnboundedSender<(u64, LinkFault)>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, LinkFault)>>>,
    recovery: Mutex<Recovery>,
    stopped: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
}

/// Connection and channel owned by one domain.
///
/// Cloning is cheap and yields a handle to the same session.
#[derive(Clone)]
pub struct ChannelSession {
    inner: Arc<SessionInner>,
}

impl ChannelSession {
    /// Create a session in the `Disconnected` state. No I/O happens until [`start`](Self::start).
    #[must_use]
    pub fn new(
        domain: Domain,
        broker: Arc<dyn Broker>,
        settings: BrokerSettings,
        topology: Topology,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(SessionInner {
                domain,
                broker,
                settings,
                topology,
                policy,
                state,
                link: RwLock::new(None),
                generation: AtomicU64::new(0),
                faults_tx,
                faults_rx: Mutex::new(Some(faults_rx)),
                recovery: Mutex::new(Recovery::default()),
                stopped: AtomicBool::new(false),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Domain this session belongs to.
    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.inner.domain
    }

    /// Exchange requests and responses travel through.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.inner.topology.exchange
    }

    /// Origin tag stamped on outgoing messages.
    #[must_use]
    pub fn origin_tag(&self) -> &str {
        &self.inner.settings.origin_tag
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The current channel, if connected.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.current_link().map(|(_, channel)| channel)
    }

    /// The current channel together with its link generation.
    #[must_use]
    pub fn current_link(&self) -> Option<(u64, Arc<dyn BrokerChannel>)> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| (link.generation, Arc::clone(&link.channel)))
    }

    /// Generation of the current link, if any.
    #[must_use]
    pub fn link_generation(&self) -> Option<u64> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|link| link.generation)
    }

    /// Report a fault observed outside the adapter (e.g. a consumer stream that ended).
    pub fn report_fault(&self, generation: u64, fault: LinkFault) {
        let _ = self.inner.faults_tx.send((generation, fault));
    }

    /// Connect, open a channel and declare the topology.
    ///
    /// Attempts follow the reconnect policy. Calling `start` on a session that is already
    /// connected (or reconnecting) is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] when the attempt budget is exhausted (the session is
    /// then `Fatal`) or when the session was already stopped.
    pub async fn start(&self) -> Result<(), RpcError> {
        let _guard = self.inner.start_lock.lock().await;

        match self.state() {
            SessionState::Connected | SessionState::Reconnecting => return Ok(()),
            SessionState::Fatal { reason } => {
                return Err(self.connection_error(reason));
            }
            SessionState::Closed => {
                return Err(self.connection_error("session closed".to_string()));
            }
            SessionState::Disconnected | SessionState::Connecting => {}
        }

        self.spawn_fault_watcher();
        self.recovery().running = true;
        self.set_state(SessionState::Connecting);

        tracing::info!(
            domain = %self.inner.domain,
            host = %self.inner.settings.host,
            port = self.inner.settings.port,
            exchange = %self.inner.topology.exchange,
            "Starting broker session"
        );

        let result = match self.connect_loop().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let reason = err.to_string();
                if !self.inner.stopped.load(Ordering::SeqCst) {
                    self.enter_fatal(reason.clone());
                }
                Err(self.connection_error(reason))
            }
        };
        self.settle();
        result
    }

    /// Close the channel, then the connection. Safe from any state and idempotent.
    pub async fn stop(&self) {
        let already_stopped = self.inner.stopped.swap(true, Ordering::SeqCst);

        let link = self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(link) = link {
            close_link(&self.inner.domain, &link).await;
        }

        self.set_state(SessionState::Closed);
        SessionMetrics::record_connected(&self.inner.domain, false);

        if !already_stopped {
            tracing::info!(domain = %self.inner.domain, "Broker session stopped");
        }
    }

    fn connection_error(&self, reason: String) -> RpcError {
        RpcError::Connection {
            domain: self.inner.domain.clone(),
            reason,
        }
    }

    /// Publish `next` unless the session already reached a terminal state.
    fn set_state(&self, next: SessionState) {
        let domain = &self.inner.domain;
        self.inner.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            tracing::debug!(%domain, from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
    }

    fn enter_fatal(&self, reason: String) {
        tracing::error!(
            domain = %self.inner.domain,
            attempts = self.inner.policy.max_attempts,
            reason = %reason,
            "Broker session is fatal, giving up"
        );
        SessionMetrics::record_fatal(&self.inner.domain);
        SessionMetrics::record_connected(&self.inner.domain, false);
        self.set_state(SessionState::Fatal { reason });
    }

    async fn connect_loop(&self) -> Result<(), BrokerError> {
        let stopped = &self.inner.stopped;
        retry_connect(
            &self.inner.policy,
            |attempt| self.connect_once(attempt),
            |_: &BrokerError| !stopped.load(Ordering::SeqCst),
        )
        .await
    }

    async fn connect_once(&self, attempt: usize) -> Result<(), BrokerError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        SessionMetrics::record_connect_attempt(&inner.domain);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = FaultSink::new(generation, inner.faults_tx.clone());

        tracing::debug!(domain = %inner.domain, attempt, generation, "Connecting to broker");

        let connection = inner.broker.connect(&inner.settings, sink.clone()).await?;
        let channel = match connection.open_channel(sink).await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        let link = Link {
            generation,
            connection,
            channel,
        };

        if let Err(err) = declare_topology(link.channel.as_ref(), &inner.topology).await {
            close_link(&inner.domain, &link).await;
            return Err(err);
        }

        if inner.stopped.load(Ordering::SeqCst) {
            close_link(&inner.domain, &link).await;
            return Err(BrokerError::Closed);
        }

        *inner.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
        self.set_state(SessionState::Connected);
        SessionMetrics::record_connected(&inner.domain, true);

        tracing::info!(
            domain = %inner.domain,
            generation,
            exchange = %inner.topology.exchange,
            queues = inner.topology.queues.len(),
            "Broker session connected"
        );

        Ok(())
    }

    fn spawn_fault_watcher(&self) {
        let receiver = self
            .inner
            .faults_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut faults) = receiver else {
            return;
        };

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some((generation, fault)) = faults.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let session = Self { inner };
                if session.state().is_terminal() {
                    break;
                }
                session.handle_fault(generation, &fault);
            }
        });
    }

    fn recovery(&self) -> std::sync::MutexGuard<'_, Recovery> {
        self.inner.recovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_fault(&self, generation: u64, fault: &LinkFault) {
        let domain = &self.inner.domain;

        if self.state().is_terminal() {
            return;
        }
        if generation < self.inner.generation.load(Ordering::SeqCst) {
            tracing::debug!(%domain, generation, ?fault, "Ignoring fault from a replaced link");
            return;
        }

        {
            let mut recovery = self.recovery();
            if recovery.running {
                tracing::debug!(%domain, generation, ?fault, "Holding fault until the running connect settles");
                if recovery.deferred.as_ref().is_none_or(|(held, _)| *held <= generation) {
                    recovery.deferred = Some((generation, fault.clone()));
                }
                return;
            }
            if self.link_generation() != Some(generation) || !self.state().is_connected() {
                tracing::debug!(%domain, generation, ?fault, "Ignoring fault from a link that is not current");
                return;
            }
            recovery.running = true;
        }

        tracing::warn!(
            %domain,
            generation,
            channel = fault.is_channel(),
            reason = fault.reason(),
            "Broker link lost, reconnecting"
        );

        let session = self.clone();
        tokio::spawn(async move {
            session.reconnect().await;
            session.settle();
        });
    }

    /// Mark the running connect or reconnection as finished and replay a held fault.
    fn settle(&self) {
        let deferred = {
            let mut recovery = self.recovery();
            recovery.running = false;
            recovery.deferred.take()
        };
        if let Some((generation, fault)) = deferred {
            self.handle_fault(generation, &fault);
        }
    }

    async fn reconnect(&self) {
        let inner = &self.inner;
        SessionMetrics::record_reconnect(&inner.domain);
        SessionMetrics::record_connected(&inner.domain, false);
        self.set_state(SessionState::Reconnecting);

        let old = inner.link.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(old) = old {
            close_link(&inner.domain, &old).await;
        }

        match self.connect_loop().await {
            Ok(()) => {
                tracing::info!(domain = %inner.domain, "Broker session re-established");
            }
            Err(err) => {
                if !inner.stopped.load(Ordering::SeqCst) {
                    self.enter_fatal(err.to_string());
                }
            }
        }
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("domain", &self.inner.domain)
            .field("state", &*self.inner.state.borrow())
            .field("generation", &self.link_generation())
            .finish_non_exhaustive()
    }
}

async fn declare_topology(channel: &dyn BrokerChannel, topology: &Topology) -> Result<(), BrokerError> {
    channel.declare_exchange(&topology.exchange).await?;
    for binding in &topology.queues {
        channel.declare_queue(&binding.queue).await?;
        channel
            .bind_queue(&binding.queue, &topology.exchange, &binding.routing_key)
            .await?;
    }
    Ok(())
}

async fn close_link(domain: &Domain, link: &Link) {
    if let Err(err) = link.channel.close().await {
        tracing::debug!(%domain, generation = link.generation, error = %err, "Channel close failed");
    }
    if let Err(err) = link.connection.close().await {
        tracing::debug!(%domain, generation = link.generation, error = %err, "Connection close failed");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use brokered_rpc_testing::{InMemoryBroker, TEST_EXCHANGE, test_settings};
    use std::time::Duration;

    fn session(broker: &InMemoryBroker) -> ChannelSession {
        ChannelSession::new(
            Domain::new("sender"),
            Arc::new(broker.clone()),
            test_settings(),
            Topology::for_domain(TEST_EXCHANGE, &DomainSpec::for_domain("sender")),
            ReconnectPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fault_while_a_reconnection_settles_is_replayed() {
        let broker = InMemoryBroker::new();
        let session = session(&broker);
        session.start().await.unwrap();
        let generation = session.link_generation().unwrap();

        // Connected again, but the routine that got there has not finished yet
        session.recovery().running = true;
        session.handle_fault(generation, &LinkFault::ConnectionClosed("dropped".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(session.link_generation(), Some(generation));

        session.settle();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.link_generation().is_some_and(|current| current > generation));
        assert!(!session.recovery().running);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_for_a_link_still_being_installed_is_not_lost() {
        let broker = InMemoryBroker::new();
        let session = session(&broker);
        session.start().await.unwrap();

        // The next attempt has taken its generation but has not installed its link
        session.recovery().running = true;
        let installing = session.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        session.handle_fault(installing, &LinkFault::ChannelError("closed by peer".into()));

        assert!(session.recovery().deferred.as_ref().is_some_and(|(held, _)| *held == installing));
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_fault_for_a_replaced_link_is_ignored() {
        let broker = InMemoryBroker::new();
        let session = session(&broker);
        session.start().await.unwrap();
        let generation = session.link_generation().unwrap();

        session.recovery().running = true;
        session.handle_fault(generation, &LinkFault::ConnectionClosed("dropped".into()));
        // A later attempt replaced the link before the routine settled
        session.inner.generation.fetch_add(1, Ordering::SeqCst);
        session.settle();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(session.state(), SessionState::Connected);
    }
}
