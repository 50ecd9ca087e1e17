//! Domain keys and their queue layout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a queue name to form its routing key.
pub const ROUTING_KEY_SUFFIX: &str = "_rk";

/// Key selecting an isolated RPC bundle (e.g. `"sender"`, `"payments"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(String);

impl Domain {
    /// Create a domain key.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The domain name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Domain {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Domain {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Queue layout of one domain.
///
/// Requests are published to `request_queue`; responses for this process arrive on
/// `response_queue`. Both are bound to the shared exchange under `<queue>_rk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// The domain key
    pub domain: Domain,
    /// Queue the remote responder reads requests from
    pub request_queue: String,
    /// Queue this process reads responses from
    pub response_queue: String,
}

impl DomainSpec {
    /// Layout with explicit queue names.
    #[must_use]
    pub fn new(
        domain: impl Into<Domain>,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
        }
    }

    /// Conventional layout: `<domain>_requests` and `<domain>_responses`.
    #[must_use]
    pub fn for_domain(domain: impl Into<Domain>) -> Self {
        let domain = domain.into();
        let request_queue = format!("{domain}_requests");
        let response_queue = format!("{domain}_responses");
        Self {
            domain,
            request_queue,
            response_queue,
        }
    }

    /// Routing key requests are published under.
    #[must_use]
    pub fn request_routing_key(&self) -> String {
        routing_key(&self.request_queue)
    }

    /// Routing key responses are published under.
    #[must_use]
    pub fn response_routing_key(&self) -> String {
        routing_key(&self.response_queue)
    }
}

/// Routing key bound to `queue`.
#[must_use]
pub fn routing_key(queue: &str) -> String {
    format!("{queue}{ROUTING_KEY_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_layout_derives_from_domain() {
        let spec = DomainSpec::for_domain("payments");
        assert_eq!(spec.request_queue, "payments_requests");
        assert_eq!(spec.response_queue, "payments_responses");
        assert_eq!(spec.request_routing_key(), "payments_requests_rk");
        assert_eq!(spec.response_routing_key(), "payments_responses_rk");
    }

    #[test]
    fn explicit_layout_is_kept() {
        let spec = DomainSpec::new("sender", "bbsender_in", "bbsender_out");
        assert_eq!(spec.domain, Domain::from("sender"));
        assert_eq!(spec.response_routing_key(), "bbsender_out_rk");
    }
}
