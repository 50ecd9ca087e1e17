//! Outstanding requests of one domain, keyed by correlation id.
//!
//! Each entry is removed exactly once, by whichever of [`ResponseTable::resolve`],
//! [`ResponseTable::expire`], [`ResponseTable::fail`], [`ResponseTable::fail_all`] or
//! [`ResponseTable::discard`] gets there first. Removal is a single check-and-delete under
//! the table lock; the waiter is completed after the lock is released.

use crate::error::RpcError;
use brokered_rpc_core::domain::Domain;
use brokered_rpc_core::envelope::{CorrelationId, Method, ResponseEnvelope};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

type Completion = oneshot::Sender<Result<ResponseEnvelope, RpcError>>;

struct PendingRequest {
    method: Method,
    created_at: Instant,
    completion: Completion,
}

/// Pending-request table of one domain.
pub struct ResponseTable {
    domain: Domain,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl ResponseTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new outstanding request.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelation`] if `correlation_id` is already outstanding.
    pub fn register(&self, correlation_id: CorrelationId, method: Method) -> Result<Waiter, RpcError> {
        let (completion, receiver) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if pending.contains_key(&correlation_id) {
            return Err(RpcError::DuplicateCorrelation(correlation_id));
        }

        pending.insert(
            correlation_id.clone(),
            PendingRequest {
                method,
                created_at: Instant::now(),
                completion,
            },
        );
        drop(pending);

        tracing::trace!(domain = %self.domain, %correlation_id, "Request registered");

        Ok(Waiter {
            domain: self.domain.clone(),
            correlation_id,
            receiver,
        })
    }

    /// Complete the request with `response`.
    ///
    /// Returns `false` (and logs a warning) if the id is unknown, e.g. it already timed out.
    pub fn resolve(&self, correlation_id: &CorrelationId, response: ResponseEnvelope) -> bool {
        let Some(request) = self.remove(correlation_id) else {
            tracing::warn!(
                domain = %self.domain,
                %correlation_id,
                method = %response.method,
                "Dropping response for unknown or expired request"
            );
            return false;
        };

        tracing::debug!(
            domain = %self.domain,
            %correlation_id,
            method = %request.method,
            status = ?response.status,
            "Response matched"
        );
        let _ = request.completion.send(Ok(response));
        true
    }

    /// Complete the request with a timeout error. No-op if it was already removed.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        let Some(request) = self.remove(correlation_id) else {
            return false;
        };

        let after = request.created_at.elapsed();
        tracing::warn!(
            domain = %self.domain,
            %correlation_id,
            method = %request.method,
            waited_ms = after.as_millis(),
            "Request timed out"
        );
        let _ = request.completion.send(Err(RpcError::Timeout {
            method: request.method,
            correlation_id: correlation_id.clone(),
            after,
        }));
        true
    }

    /// Complete the request with `error`. No-op if it was already removed.
    pub fn fail(&self, correlation_id: &CorrelationId, error: RpcError) -> bool {
        let Some(request) = self.remove(correlation_id) else {
            return false;
        };

        tracing::warn!(
            domain = %self.domain,
            %correlation_id,
            method = %request.method,
            error = %error,
            "Request failed"
        );
        let _ = request.completion.send(Err(error));
        true
    }

    /// Complete every outstanding request with `error`. Returns how many were drained.
    pub fn fail_all(&self, error: &RpcError) -> usize {
        let drained: Vec<PendingRequest> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, request)| request)
            .collect();

        let count = drained.len();
        for request in drained {
            let _ = request.completion.send(Err(error.clone()));
        }

        if count > 0 {
            tracing::warn!(domain = %self.domain, count, error = %error, "Failed all pending requests");
        }
        count
    }

    /// Remove the request without completing it.
    pub fn discard(&self, correlation_id: &CorrelationId) -> bool {
        self.remove(correlation_id).is_some()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, correlation_id: &CorrelationId) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)
    }
}

/// Completion side of a registered request.
///
/// Resolves once the table entry is resolved, expired or failed. If the entry is discarded
/// or the table goes away, the waiter yields [`RpcError::DomainUnavailable`].
#[derive(Debug)]
pub struct Waiter {
    domain: Domain,
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<ResponseEnvelope, RpcError>>,
}

impl Waiter {
    /// Correlation id this waiter is registered under.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for Waiter {
    type Output = Result<ResponseEnvelope, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::DomainUnavailable(self.domain.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn table() -> ResponseTable {
        ResponseTable::new(Domain::new("sender"))
    }

    #[tokio::test]
    async fn resolve_completes_waiter() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let waiter = table.register(id.clone(), Method::SAVE_FILE).unwrap();

        assert!(table.resolve(&id, ResponseEnvelope::ok(Method::SAVE_FILE, json!({"saved": true}))));

        let response = waiter.await.unwrap();
        assert_eq!(response.data, json!({"saved": true}));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let _waiter = table.register(id.clone(), Method::SAVE_FILE).unwrap();

        let err = table.register(id.clone(), Method::READ_FILE).unwrap_err();
        assert_eq!(err, RpcError::DuplicateCorrelation(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn id_is_reusable_after_removal() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let _first = table.register(id.clone(), Method::SAVE_FILE).unwrap();
        assert!(table.discard(&id));
        assert!(table.register(id, Method::SAVE_FILE).is_ok());
    }

    #[test]
    fn unknown_resolution_is_dropped() {
        let table = table();
        assert!(!table.resolve(&CorrelationId::from("ghost"), ResponseEnvelope::ok(Method::UNKNOWN, json!(null))));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_reports_elapsed_time() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let waiter = table.register(id.clone(), Method::READ_FILE).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(table.expire(&id));

        match waiter.await {
            Err(RpcError::Timeout { method, correlation_id, after }) => {
                assert_eq!(method, Method::READ_FILE);
                assert_eq!(correlation_id, id);
                assert_eq!(after, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exactly_one_of_resolve_and_expire_wins() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let waiter = table.register(id.clone(), Method::SAVE_FILE).unwrap();

        assert!(table.expire(&id));
        assert!(!table.resolve(&id, ResponseEnvelope::ok(Method::SAVE_FILE, json!(1))));
        assert!(!table.expire(&id));
        assert!(matches!(waiter.await, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test]
    async fn fail_all_drains_every_waiter() {
        let table = table();
        let first = table.register(CorrelationId::from("a"), Method::SAVE_FILE).unwrap();
        let second = table.register(CorrelationId::from("b"), Method::READ_FILE).unwrap();
        let error = RpcError::Connection {
            domain: Domain::new("sender"),
            reason: "broker gone".into(),
        };

        assert_eq!(table.fail_all(&error), 2);
        assert_eq!(first.await.unwrap_err(), error);
        assert_eq!(second.await.unwrap_err(), error);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn discarded_waiter_reports_domain_unavailable() {
        let table = table();
        let id = CorrelationId::from("c-1");
        let waiter = table.register(id.clone(), Method::SAVE_FILE).unwrap();

        assert!(table.discard(&id));
        assert_eq!(
            waiter.await.unwrap_err(),
            RpcError::DomainUnavailable(Domain::new("sender"))
        );
    }

    #[tokio::test]
    async fn concurrent_resolve_and_expire_terminate_once() {
        for round in 0..64 {
            let table = std::sync::Arc::new(table());
            let id = CorrelationId::from(format!("race-{round}"));
            let waiter = table.register(id.clone(), Method::SAVE_FILE).unwrap();

            let resolver = {
                let table = std::sync::Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.resolve(&id, ResponseEnvelope::ok(Method::SAVE_FILE, json!(round))) })
            };
            let expirer = {
                let table = std::sync::Arc::clone(&table);
                let id = id.clone();
                tokio::spawn(async move { table.expire(&id) })
            };

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(resolved ^ expired, "exactly one termination per id");

            let outcome = waiter.await;
            assert_eq!(outcome.is_ok(), resolved);
        }
    }
}
