//! Per-domain bundles and the registry that owns them.
//!
//! The registry constructs at most one [`DomainBundle`] per domain for the lifetime of the
//! process. Bundles share nothing: each has its own session, response table, publish gate
//! and consumer.
//!
//! # Failure Handling
//!
//! When a bundle's session cannot be (re)established, the bundle fails permanently:
//!
//! 1. every pending call is completed with a connection error
//! 2. the publish gate is closed, so new calls fail with `DomainUnavailable`
//! 3. the session is stopped
//! 4. the failure observer receives one [`FailureReport`]
//!
//! The registry keeps the failed bundle and answers `DomainUnavailable` for that domain
//! until the process restarts.

use crate::client::RpcClient;
use crate::consumer::ConsumerLoop;
use crate::error::RpcError;
use crate::gate::PublishGate;
use crate::observer::LoggingFailureObserver;
use crate::producer::Producer;
use crate::reconnect::ReconnectPolicy;
use crate::session::{ChannelSession, SessionState, Topology};
use crate::table::ResponseTable;
use brokered_rpc_core::broker::Broker;
use brokered_rpc_core::config::{BrokerSettings, RpcSettings};
use brokered_rpc_core::domain::{Domain, DomainSpec};
use brokered_rpc_core::environment::{Clock, SystemClock};
use brokered_rpc_core::observer::{FailureObserver, FailurePath, FailureReport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Everything one domain needs to make calls.
pub struct DomainBundle {
    spec: DomainSpec,
    origin_tag: String,
    call_timeout: Duration,
    session: ChannelSession,
    table: Arc<ResponseTable>,
    gate: Arc<PublishGate>,
    producer: Arc<Producer>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    watchdog_started: AtomicBool,
    failed: AtomicBool,
    observer: Arc<dyn FailureObserver>,
    clock: Arc<dyn Clock>,
}

impl DomainBundle {
    fn new(
        spec: DomainSpec,
        broker: Arc<dyn Broker>,
        settings: &BrokerSettings,
        rpc: &RpcSettings,
        observer: Arc<dyn FailureObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let domain = spec.domain.clone();
        let session = ChannelSession::new(
            domain.clone(),
            broker,
            settings.clone(),
            Topology::for_domain(settings.exchange.clone(), &spec),
            ReconnectPolicy::from_settings(rpc),
        );
        let producer = Producer::new(session.clone(), spec.request_routing_key());

        Self {
            origin_tag: settings.origin_tag.clone(),
            call_timeout: rpc.call_timeout,
            table: Arc::new(ResponseTable::new(domain.clone())),
            gate: Arc::new(PublishGate::new(domain, rpc.publish_concurrency, rpc.publish_pacing)),
            producer: Arc::new(producer),
            session,
            spec,
            consumer: Mutex::new(None),
            watchdog_started: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            observer,
            clock,
        }
    }

    /// The domain key.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.spec.domain
    }

    /// Queue layout of this domain.
    #[must_use]
    pub const fn spec(&self) -> &DomainSpec {
        &self.spec
    }

    /// The domain's broker session.
    #[must_use]
    pub const fn session(&self) -> &ChannelSession {
        &self.session
    }

    /// The domain's pending-request table.
    #[must_use]
    pub const fn table(&self) -> &Arc<ResponseTable> {
        &self.table
    }

    /// Whether the domain failed permanently.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// A client calling into this domain.
    #[must_use]
    pub fn client(&self) -> RpcClient {
        RpcClient::new(
            self.spec.domain.clone(),
            self.origin_tag.clone(),
            Arc::clone(&self.table),
            Arc::clone(&self.gate),
            Arc::clone(&self.producer),
        )
        .with_call_timeout(self.call_timeout)
    }

    /// Start the session and the response consumer. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Connection`] if the broker cannot be reached within the retry
    /// budget (the domain is then failed), or [`RpcError::DomainUnavailable`] if it already
    /// failed.
    pub async fn start_listening(self: &Arc<Self>) -> Result<(), RpcError> {
        self.start_session(FailurePath::Listening).await?;

        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        if consumer.is_none() {
            let task = ConsumerLoop::new(
                self.session.clone(),
                Arc::clone(&self.table),
                self.spec.response_queue.clone(),
            )
            .spawn();
            *consumer = Some(task);
            tracing::info!(
                domain = %self.spec.domain,
                queue = %self.spec.response_queue,
                "Listening for responses"
            );
        }
        Ok(())
    }

    /// Start the session for publishing. Idempotent.
    ///
    /// # Errors
    ///
    /// Same as [`start_listening`](Self::start_listening).
    pub async fn start_publishing(self: &Arc<Self>) -> Result<(), RpcError> {
        self.start_session(FailurePath::Publishing).await?;
        tracing::info!(
            domain = %self.spec.domain,
            routing_key = %self.producer.routing_key(),
            concurrency = self.gate.concurrency(),
            pacing_ms = u64::try_from(self.gate.pacing().as_millis()).unwrap_or(u64::MAX),
            "Ready to publish requests"
        );
        Ok(())
    }

    /// Stop the session and reject pending and future calls.
    pub async fn shutdown(&self) {
        self.gate.close();
        self.session.stop().await;

        let unavailable = RpcError::DomainUnavailable(self.spec.domain.clone());
        self.table.fail_all(&unavailable);

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = consumer {
            let _ = task.await;
        }
    }

    async fn start_session(self: &Arc<Self>, path: FailurePath) -> Result<(), RpcError> {
        if self.is_failed() || self.session.state() == SessionState::Closed {
            return Err(RpcError::DomainUnavailable(self.spec.domain.clone()));
        }

        if let Err(err) = self.session.start().await {
            if self.session.state() == SessionState::Closed {
                return Err(RpcError::DomainUnavailable(self.spec.domain.clone()));
            }
            let reason = match &err {
                RpcError::Connection { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            self.fail(path, reason).await;
            return Err(err);
        }

        self.spawn_watchdog();
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        if self.watchdog_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut states = self.session.subscribe();
        let bundle: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                match state {
                    SessionState::Fatal { reason } => {
                        if let Some(bundle) = bundle.upgrade() {
                            bundle.fail(FailurePath::Session, reason).await;
                        }
                        break;
                    }
                    SessionState::Closed => break,
                    _ => {}
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Fail the domain permanently. Only the first call has an effect.
    async fn fail(&self, path: FailurePath, reason: String) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }

        let domain = self.spec.domain.clone();
        let error = RpcError::Connection {
            domain: domain.clone(),
            reason: reason.clone(),
        };
        let drained = self.table.fail_all(&error);
        self.gate.close();
        self.session.stop().await;

        tracing::error!(%domain, %path, %reason, drained, "Domain failed permanently");

        let report = FailureReport {
            domain,
            path,
            reason,
            occurred_at: self.clock.now(),
        };
        self.observer.on_failure(report).await;
    }
}

impl std::fmt::Debug for DomainBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainBundle")
            .field("spec", &self.spec)
            .field("session", &self.session)
            .field("pending", &self.table.len())
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}

/// Process-wide owner of domain bundles.
///
/// # Example
///
/// ```rust,ignore
/// let registry = ProviderRegistry::from_env(Arc::new(LapinBroker::new()))?;
/// registry.start_listening("sender").await?;
/// registry.start_publishing("sender").await?;
///
/// let response = registry
///     .client("sender")?
///     .call(Method::SEND_EMAIL, &json!({ "to": "ops@example.com" }))
///     .await?;
/// ```
pub struct ProviderRegistry {
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
    rpc: RpcSettings,
    observer: Arc<dyn FailureObserver>,
    clock: Arc<dyn Clock>,
    specs: Mutex<HashMap<Domain, DomainSpec>>,
    bundles: Mutex<HashMap<Domain, Arc<DomainBundle>>>,
}

impl ProviderRegistry {
    /// Registry using `broker` with validated settings.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if `rpc` is invalid.
    pub fn new(broker: Arc<dyn Broker>, settings: BrokerSettings, rpc: RpcSettings) -> Result<Self, RpcError> {
        rpc.validate()?;
        Ok(Self {
            broker,
            settings,
            rpc,
            observer: Arc::new(LoggingFailureObserver),
            clock: Arc::new(SystemClock),
            specs: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
        })
    }

    /// Registry configured from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if a required variable is missing or a value is invalid.
    pub fn from_env(broker: Arc<dyn Broker>) -> Result<Self, RpcError> {
        let settings = BrokerSettings::from_env()?;
        let rpc = RpcSettings::from_env()?;
        Self::new(broker, settings, rpc)
    }

    /// Use `observer` for permanent domain failures.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `clock` for failure report timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Broker settings in use.
    #[must_use]
    pub const fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Declare the queue layout of a domain before first use.
    ///
    /// Returns `false` (and changes nothing) if the domain's bundle already exists.
    pub fn register_domain(&self, spec: DomainSpec) -> bool {
        let bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);
        if bundles.contains_key(&spec.domain) {
            tracing::warn!(domain = %spec.domain, "Domain already in use, layout not changed");
            return false;
        }

        tracing::debug!(
            domain = %spec.domain,
            request_queue = %spec.request_queue,
            response_queue = %spec.response_queue,
            "Domain layout registered"
        );
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.domain.clone(), spec);
        true
    }

    /// The bundle of `domain`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DomainUnavailable`] if the domain failed permanently.
    pub fn get_or_create(&self, domain: impl Into<Domain>) -> Result<Arc<DomainBundle>, RpcError> {
        let domain = domain.into();
        let mut bundles = self.bundles.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bundle) = bundles.get(&domain) {
            if bundle.is_failed() {
                return Err(RpcError::DomainUnavailable(domain));
            }
            return Ok(Arc::clone(bundle));
        }

        let spec = self
            .specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| DomainSpec::for_domain(domain.clone()));

        tracing::info!(
            %domain,
            request_queue = %spec.request_queue,
            response_queue = %spec.response_queue,
            "Creating domain bundle"
        );

        let bundle = Arc::new(DomainBundle::new(
            spec,
            Arc::clone(&self.broker),
            &self.settings,
            &self.rpc,
            Arc::clone(&self.observer),
            Arc::clone(&self.clock),
        ));
        bundles.insert(domain, Arc::clone(&bundle));
        Ok(bundle)
    }

    /// A client for `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DomainUnavailable`] if the domain failed permanently.
    pub fn client(&self, domain: impl Into<Domain>) -> Result<RpcClient, RpcError> {
        Ok(self.get_or_create(domain)?.client())
    }

    /// Start consuming responses for `domain`.
    ///
    /// # Errors
    ///
    /// See [`DomainBundle::start_listening`].
    pub async fn start_listening(&self, domain: impl Into<Domain>) -> Result<(), RpcError> {
        self.get_or_create(domain)?.start_listening().await
    }

    /// Prepare `domain` for publishing requests.
    ///
    /// # Errors
    ///
    /// See [`DomainBundle::start_publishing`].
    pub async fn start_publishing(&self, domain: impl Into<Domain>) -> Result<(), RpcError> {
        self.get_or_create(domain)?.start_publishing().await
    }

    /// Domains with a bundle, sorted.
    #[must_use]
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        domains.sort();
        domains
    }

    /// Stop every bundle.
    pub async fn shutdown(&self) {
        let bundles: Vec<Arc<DomainBundle>> = self
            .bundles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for bundle in bundles {
            bundle.shutdown().await;
        }
        tracing::info!("Provider registry shut down");
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("settings", &self.settings)
            .field("rpc", &self.rpc)
            .field("domains", &self.domains())
            .finish_non_exhaustive()
    }
}
