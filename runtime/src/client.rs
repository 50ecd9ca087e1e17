//! Call-and-wait surface over a domain bundle.
//!
//! # Call Flow
//!
//! ```text
//! generate id ─▶ register ─▶ gate.acquire ─▶ publish ─▶ release ─▶ wait
//! │◀──────────────────────────── one deadline ───────────────────────────▶│
//!                                    expire on timeout, then read the waiter once more
//! ```
//!
//! The timeout starts when the call does and bounds everything after it: queueing at the
//! gate, waiting for a reconnecting session, publishing and waiting for the response.
//! A timed-out call does not retract a request that was already published; a late response
//! is dropped by the consumer.

use crate::error::RpcError;
use crate::gate::PublishGate;
use crate::metrics::RpcMetrics;
use crate::producer::Producer;
use crate::table::ResponseTable;
use brokered_rpc_core::domain::Domain;
use brokered_rpc_core::envelope::{CorrelationId, Method, RequestEnvelope, ResponseEnvelope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default time a call may take.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound for deadlines of calls with an unrepresentable timeout.
const MAX_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// RPC client of one domain.
///
/// Cheap to clone; clones share the domain's table, gate and producer.
#[derive(Clone)]
pub struct RpcClient {
    domain: Domain,
    origin_tag: String,
    table: Arc<ResponseTable>,
    gate: Arc<PublishGate>,
    producer: Arc<Producer>,
    call_timeout: Duration,
}

impl RpcClient {
    /// Assemble a client from the parts of a domain bundle.
    #[must_use]
    pub fn new(
        domain: Domain,
        origin_tag: impl Into<String>,
        table: Arc<ResponseTable>,
        gate: Arc<PublishGate>,
        producer: Arc<Producer>,
    ) -> Self {
        Self {
            domain,
            origin_tag: origin_tag.into(),
            table,
            gate,
            producer,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the default call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Domain this client calls into.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Default call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Call `method` with `body` using the default timeout.
    ///
    /// # Errors
    ///
    /// See [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call<B>(&self, method: impl Into<Method>, body: &B) -> Result<ResponseEnvelope, RpcError>
    where
        B: Serialize + ?Sized,
    {
        self.call_with_timeout(method, body, self.call_timeout).await
    }

    /// Call `method` with `body`, taking at most `timeout` from start to response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Timeout`] if no response arrived in time
    /// - [`RpcError::Application`] if the responder reported status `error`
    /// - [`RpcError::MalformedResponse`] if the response could not be decoded
    /// - [`RpcError::DomainUnavailable`] if the domain failed permanently
    /// - [`RpcError::Publish`], [`RpcError::Channel`], [`RpcError::Connection`] if the
    ///   request could not be sent
    pub async fn call_with_timeout<B>(
        &self,
        method: impl Into<Method>,
        body: &B,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RpcError>
    where
        B: Serialize + ?Sized,
    {
        let method = method.into();
        let started = Instant::now();
        RpcMetrics::record_call(&self.domain);

        let result = self.execute(method, body, timeout).await;

        RpcMetrics::record_completion(&self.domain, started.elapsed());
        if let Err(err) = &result {
            RpcMetrics::record_failure(&self.domain, err.kind());
        }
        result
    }

    /// Call `method` and decode the response `data` into `T`.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, plus [`RpcError::Serialization`] if `data`
    /// does not match `T`.
    pub async fn call_as<T, B>(&self, method: impl Into<Method>, body: &B) -> Result<T, RpcError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.call(method, body).await?;
        Ok(serde_json::from_value(response.data)?)
    }

    async fn execute<B>(&self, method: Method, body: &B, timeout: Duration) -> Result<ResponseEnvelope, RpcError>
    where
        B: Serialize + ?Sized,
    {
        let body = serde_json::to_value(body)?;
        let request = RequestEnvelope::new(method.clone(), self.origin_tag.clone(), body);
        let correlation_id = CorrelationId::generate();

        let mut waiter = self.table.register(correlation_id.clone(), method.clone())?;
        let _pending = PendingGuard {
            table: &self.table,
            correlation_id: &correlation_id,
        };

        let started = Instant::now();
        let deadline = started.checked_add(timeout).unwrap_or_else(|| started + MAX_DEADLINE);

        let sent = tokio::time::timeout_at(deadline, async {
            let permit = self.gate.acquire().await?;
            self.producer.publish(&request, &correlation_id).await?;
            permit.release();
            Ok::<(), RpcError>(())
        })
        .await;
        match sent {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    domain = %self.domain,
                    %correlation_id,
                    %method,
                    ?timeout,
                    "Call timed out before the request was published"
                );
                return Err(RpcError::Timeout {
                    method,
                    correlation_id: correlation_id.clone(),
                    after: timeout,
                });
            }
        }
        RpcMetrics::record_publish(&self.domain, started.elapsed());

        let outcome = match tokio::time::timeout_at(deadline, &mut waiter).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Resolution may have won the race; the waiter holds whichever came first
                self.table.expire(&correlation_id);
                waiter.await
            }
        };

        let response = outcome?;
        if response.is_ok() {
            tracing::debug!(domain = %self.domain, %correlation_id, %method, "Call succeeded");
            Ok(response)
        } else {
            Err(RpcError::Application {
                method,
                message: response.error_message(),
            })
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("domain", &self.domain)
            .field("origin_tag", &self.origin_tag)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Removes the table entry if the call ends before the entry was terminated.
struct PendingGuard<'a> {
    table: &'a ResponseTable,
    correlation_id: &'a CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.discard(self.correlation_id) {
            tracing::debug!(correlation_id = %self.correlation_id, "Discarded abandoned request");
        }
    }
}
