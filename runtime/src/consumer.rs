//! Response consumption for one domain.
//!
//! The loop follows the session's state: it starts consuming whenever the session is
//! connected, re-subscribes after every reconnection, and exits once the session is
//! `Fatal` or `Closed`.

use crate::error::RpcError;
use crate::metrics::RpcMetrics;
use crate::session::{ChannelSession, SessionState};
use crate::table::ResponseTable;
use brokered_rpc_core::broker::{BrokerMessage, DeliveryStream, LinkFault};
use brokered_rpc_core::envelope::{CorrelationId, ResponseEnvelope};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why draining a delivery stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    /// The broker ended the stream
    StreamClosed,
    /// The session moved away from the link being drained
    StateChanged,
    /// The session was dropped
    SessionGone,
}

/// Consumer of a domain's response queue.
pub struct ConsumerLoop {
    session: ChannelSession,
    table: Arc<ResponseTable>,
    queue: String,
    consumer_tag: String,
}

impl ConsumerLoop {
    /// Consumer for `queue`, resolving into `table`.
    #[must_use]
    pub fn new(session: ChannelSession, table: Arc<ResponseTable>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let consumer_tag = format!("{}.{}", session.origin_tag(), queue);
        Self {
            session,
            table,
            queue,
            consumer_tag,
        }
    }

    /// Run the loop on the current runtime.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume until the session reaches a terminal state.
    pub async fn run(self) {
        let domain = self.session.domain().clone();
        let mut states = self.session.subscribe();

        tracing::info!(%domain, queue = %self.queue, "Response consumer started");

        loop {
            let state = states.borrow_and_update().clone();
            if state.is_terminal() {
                break;
            }

            let link = if state.is_connected() { self.session.current_link() } else { None };
            if let Some((generation, channel)) = link {
                match channel.consume(&self.queue, &self.consumer_tag).await {
                    Ok(stream) => match self.drain(stream, generation, &mut states).await {
                        DrainEnd::StreamClosed => {
                            if self.session.link_generation() != Some(generation) {
                                // Link already replaced; consume on the new one
                                continue;
                            }
                            tracing::warn!(%domain, queue = %self.queue, generation, "Response stream ended");
                            self.session.report_fault(
                                generation,
                                LinkFault::ChannelClosed("consumer stream ended".to_string()),
                            );
                        }
                        DrainEnd::StateChanged => continue,
                        DrainEnd::SessionGone => break,
                    },
                    Err(err) => {
                        tracing::warn!(%domain, queue = %self.queue, error = %err, "Could not start consuming");
                        self.session
                            .report_fault(generation, LinkFault::ChannelError(err.to_string()));
                    }
                }
            }

            if states.changed().await.is_err() {
                break;
            }
        }

        tracing::info!(%domain, queue = %self.queue, "Response consumer stopped");
    }

    async fn drain(
        &self,
        mut stream: DeliveryStream,
        generation: u64,
        states: &mut watch::Receiver<SessionState>,
    ) -> DrainEnd {
        loop {
            tokio::select! {
                delivery = stream.next() => match delivery {
                    Some(Ok(message)) => self.handle_delivery(message),
                    Some(Err(err)) => {
                        tracing::warn!(
                            domain = %self.session.domain(),
                            queue = %self.queue,
                            error = %err,
                            "Delivery error"
                        );
                    }
                    None => return DrainEnd::StreamClosed,
                },
                changed = states.changed() => {
                    if changed.is_err() {
                        return DrainEnd::SessionGone;
                    }
                    let connected = states.borrow().is_connected();
                    if !connected || self.session.link_generation() != Some(generation) {
                        return DrainEnd::StateChanged;
                    }
                }
            }
        }
    }

    fn handle_delivery(&self, message: BrokerMessage) {
        let domain = self.session.domain();
        RpcMetrics::record_delivery(domain);

        let Some(token) = message.correlation_id.filter(|token| !token.is_empty()) else {
            tracing::warn!(
                %domain,
                queue = %self.queue,
                content_type = ?message.content_type,
                "Dropping delivery without correlation id"
            );
            RpcMetrics::record_dropped(domain, "missing_correlation_id");
            return;
        };
        let correlation_id = CorrelationId::from(token);

        match ResponseEnvelope::from_slice(&message.payload) {
            Ok(response) => {
                if !self.table.resolve(&correlation_id, response) {
                    RpcMetrics::record_dropped(domain, "unknown_correlation_id");
                }
            }
            Err(err) => {
                let error = RpcError::MalformedResponse {
                    correlation_id: correlation_id.clone(),
                    reason: err.to_string(),
                };
                if !self.table.fail(&correlation_id, error) {
                    tracing::warn!(%domain, %correlation_id, error = %err, "Dropping undecodable delivery");
                    RpcMetrics::record_dropped(domain, "malformed");
                }
            }
        }
    }
}

impl std::fmt::Debug for ConsumerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerLoop")
            .field("domain", self.session.domain())
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .finish_non_exhaustive()
    }
}
