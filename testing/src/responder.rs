//! Scripted remote responders for [`InMemoryBroker`].

use crate::broker::InMemoryBroker;
use brokered_rpc_core::domain::DomainSpec;
use brokered_rpc_core::envelope::{RequestEnvelope, ResponseEnvelope};
use futures::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Answers requests arriving on a domain's request queue.
///
/// By default every request is answered with status `ok` and the request body as `data`.
///
/// # Example
///
/// ```ignore
/// let responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), "rpc")
///     .with_delay(Duration::from_millis(200))
///     .spawn();
/// ```
#[derive(Debug, Clone)]
pub struct EchoResponder {
    broker: InMemoryBroker,
    request_queue: String,
    exchange: String,
    reply_routing_key: String,
    origin_tag: String,
    delay: Duration,
}

impl EchoResponder {
    /// Responder for `spec`, replying through `exchange` to the domain's response queue.
    #[must_use]
    pub fn new(broker: &InMemoryBroker, spec: &DomainSpec, exchange: impl Into<String>) -> Self {
        Self {
            broker: broker.clone(),
            request_queue: spec.request_queue.clone(),
            exchange: exchange.into(),
            reply_routing_key: spec.response_routing_key(),
            origin_tag: format!("{}-responder", spec.domain),
            delay: Duration::ZERO,
        }
    }

    /// Wait `delay` before answering each request.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Echo every request back.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        self.spawn_with(|request| Some(ResponseEnvelope::ok(request.method.clone(), request.body.clone())))
    }

    /// Answer with `handler`; `None` leaves the request unanswered.
    #[must_use]
    pub fn spawn_with<F>(self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&RequestEnvelope) -> Option<ResponseEnvelope> + Send + Sync + 'static,
    {
        let mut requests = Box::pin(self.broker.consume_queue(&self.request_queue));

        tokio::spawn(async move {
            while let Some(message) = requests.next().await {
                let Ok((request, correlation_id)) = RequestEnvelope::from_message(&message) else {
                    tracing::warn!(queue = %self.request_queue, "Responder ignoring malformed request");
                    continue;
                };

                let Some(response) = handler(&request) else {
                    continue;
                };

                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }

                match response.to_message(&self.origin_tag, &correlation_id) {
                    Ok(reply) => {
                        self.broker.deliver(&self.exchange, &self.reply_routing_key, reply);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Responder could not encode reply");
                    }
                }
            }
        })
    }
}
