//! Bounded-concurrency gate around outbound publishing.
//!
//! Backed by a fair [`Semaphore`]: callers that cannot get a permit queue up and are
//! served in arrival order. With pacing enabled, a released permit is only handed to the
//! next caller once the pacing delay has elapsed.

use crate::error::RpcError;
use brokered_rpc_core::domain::Domain;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// FIFO publish gate.
#[derive(Debug)]
pub struct PublishGate {
    domain: Domain,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    pacing: Duration,
}

impl PublishGate {
    /// Gate admitting `concurrency` publishers at once (at least one).
    #[must_use]
    pub fn new(domain: Domain, concurrency: usize, pacing: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            domain,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            pacing,
        }
    }

    /// Wait for a permit.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DomainUnavailable`] once the gate is closed.
    pub async fn acquire(&self) -> Result<GatePermit, RpcError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::DomainUnavailable(self.domain.clone()))?;

        Ok(GatePermit {
            permit: Some(permit),
            pacing: self.pacing,
        })
    }

    /// Reject current waiters and all future acquisitions.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Permits currently free.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured concurrency.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Configured pacing delay.
    #[must_use]
    pub const fn pacing(&self) -> Duration {
        self.pacing
    }
}

/// A granted slot. Returned to the gate on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    pacing: Duration,
}

impl GatePermit {
    /// Give the slot back.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        if self.pacing.is_zero() {
            drop(permit);
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let pacing = self.pacing;
                handle.spawn(async move {
                    tokio::time::sleep(pacing).await;
                    drop(permit);
                });
            }
            Err(_) => drop(permit),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn gate(concurrency: usize, pacing: Duration) -> Arc<PublishGate> {
        Arc::new(PublishGate::new(Domain::new("sender"), concurrency, pacing))
    }

    #[test]
    fn zero_concurrency_admits_one() {
        let gate = PublishGate::new(Domain::new("sender"), 0, Duration::ZERO);
        assert_eq!(gate.concurrency(), 1);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn release_returns_the_permit() {
        let gate = gate(1, Duration::ZERO);
        let permit = gate.acquire().await.unwrap();
        assert_eq!(gate.available_permits(), 0);
        permit.release();
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn waiter_is_woken_on_release() {
        let gate = gate(1, Duration::ZERO);
        let held = gate.acquire().await.unwrap();

        let mut waiter = tokio_test::task::spawn(gate.acquire());
        tokio_test::assert_pending!(waiter.poll());

        held.release();
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready_ok!(waiter.poll());
        permit.release();
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = gate(1, Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = gate.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                permit.release();
            }));
            // Let the task enqueue before spawning the next one
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        held.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delays_the_next_grant() {
        let gate = gate(1, Duration::from_millis(1500));
        let started = Instant::now();

        gate.acquire().await.unwrap().release();
        let _second = gate.acquire().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn closed_gate_rejects_callers() {
        let gate = gate(1, Duration::ZERO);
        gate.close();
        assert!(gate.is_closed());
        assert_eq!(
            gate.acquire().await.unwrap_err(),
            RpcError::DomainUnavailable(Domain::new("sender"))
        );
    }
}
