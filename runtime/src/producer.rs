//! Publishes request envelopes through the session's current channel.

use crate::error::RpcError;
use crate::session::{ChannelSession, SessionState};
use brokered_rpc_core::broker::{BrokerChannel, BrokerError};
use brokered_rpc_core::envelope::{CorrelationId, RequestEnvelope};
use std::sync::Arc;

/// Request publisher of one domain.
#[derive(Debug, Clone)]
pub struct Producer {
    session: ChannelSession,
    routing_key: String,
}

impl Producer {
    /// Publisher sending to `routing_key` on the session's exchange.
    #[must_use]
    pub fn new(session: ChannelSession, routing_key: impl Into<String>) -> Self {
        Self {
            session,
            routing_key: routing_key.into(),
        }
    }

    /// Routing key requests are published under.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Publish `request` tagged with `correlation_id`.
    ///
    /// While the session is (re)connecting the publish waits for the link; it fails fast if
    /// the session was never started or has reached a terminal state. Callers bound the wait
    /// with their own deadline.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Serialization`] if the body cannot be encoded
    /// - [`RpcError::Channel`] / [`RpcError::Connection`] if no usable link exists
    /// - [`RpcError::Publish`] if the broker rejects the message
    pub async fn publish(&self, request: &RequestEnvelope, correlation_id: &CorrelationId) -> Result<(), RpcError> {
        let message = request.to_message(correlation_id)?;
        let (generation, channel) = self.wait_for_link().await?;

        tracing::debug!(
            domain = %self.session.domain(),
            %correlation_id,
            method = %request.method,
            routing_key = %self.routing_key,
            generation,
            "Publishing request"
        );

        channel
            .publish(self.session.exchange(), &self.routing_key, message)
            .await
            .map_err(|err| match err {
                BrokerError::ConnectionFailed(reason) => RpcError::Connection {
                    domain: self.session.domain().clone(),
                    reason,
                },
                BrokerError::ChannelFailed(reason) => RpcError::Channel {
                    domain: self.session.domain().clone(),
                    reason,
                },
                other => RpcError::Publish {
                    method: request.method.clone(),
                    reason: other.to_string(),
                },
            })
    }

    async fn wait_for_link(&self) -> Result<(u64, Arc<dyn BrokerChannel>), RpcError> {
        let mut states = self.session.subscribe();

        loop {
            let state = states.borrow_and_update().clone();
            match state {
                SessionState::Connected => {
                    if let Some(link) = self.session.current_link() {
                        return Ok(link);
                    }
                }
                SessionState::Connecting | SessionState::Reconnecting => {}
                SessionState::Disconnected => {
                    return Err(RpcError::Channel {
                        domain: self.session.domain().clone(),
                        reason: "session not started".to_string(),
                    });
                }
                SessionState::Fatal { reason } => {
                    return Err(RpcError::Connection {
                        domain: self.session.domain().clone(),
                        reason,
                    });
                }
                SessionState::Closed => {
                    return Err(RpcError::DomainUnavailable(self.session.domain().clone()));
                }
            }

            if states.changed().await.is_err() {
                return Err(RpcError::DomainUnavailable(self.session.domain().clone()));
            }
        }
    }
}
