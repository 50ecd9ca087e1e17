//! End-to-end call scenarios against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use brokered_rpc_core::broker::BrokerMessage;
use brokered_rpc_core::config::RpcSettings;
use brokered_rpc_core::domain::DomainSpec;
use brokered_rpc_core::envelope::{CorrelationId, Method, ResponseEnvelope};
use brokered_rpc_runtime::{ProviderRegistry, RpcError};
use brokered_rpc_testing::{EchoResponder, InMemoryBroker, PublishedMessage, TEST_EXCHANGE, init_test_tracing, test_settings};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn unpaced() -> RpcSettings {
    RpcSettings::default().with_publish_pacing(Duration::ZERO)
}

fn registry(broker: &InMemoryBroker, rpc: RpcSettings) -> ProviderRegistry {
    ProviderRegistry::new(Arc::new(broker.clone()), test_settings(), rpc).unwrap()
}

async fn started(broker: &InMemoryBroker, rpc: RpcSettings, domains: &[&str]) -> ProviderRegistry {
    init_test_tracing();
    let registry = registry(broker, rpc);
    for domain in domains {
        registry.start_listening(*domain).await.unwrap();
        registry.start_publishing(*domain).await.unwrap();
    }
    registry
}

async fn wait_for_published(broker: &InMemoryBroker, routing_key: &str, count: usize) -> Vec<PublishedMessage> {
    loop {
        let published = broker.published_to(routing_key);
        if published.len() >= count {
            return published;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn reply(correlation_id: &str, response: &ResponseEnvelope) -> BrokerMessage {
    response
        .to_message("remote", &CorrelationId::from(correlation_id))
        .unwrap()
}

fn body(published: &PublishedMessage) -> Value {
    serde_json::from_slice(&published.message.payload).unwrap()
}

#[tokio::test(start_paused = true)]
async fn call_round_trips_through_the_broker() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), TEST_EXCHANGE).spawn();

    let response = registry
        .client("sender")
        .unwrap()
        .call(Method::SEND_EMAIL, &json!({ "to": "ops@example.com" }))
        .await
        .unwrap();

    assert!(response.is_ok());
    assert_eq!(response.method, Method::SEND_EMAIL);
    assert_eq!(response.data, json!({ "to": "ops@example.com" }));

    let published = broker.published_to("sender_requests_rk");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].exchange, TEST_EXCHANGE);
    assert_eq!(published[0].message.content_type.as_deref(), Some("tests|send_email"));
    assert!(published[0].message.correlation_id.is_some());
    assert!(registry.get_or_create("sender").unwrap().table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn call_as_decodes_response_data() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Stored {
        path: String,
        bytes: u64,
    }

    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["storage"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("storage"), TEST_EXCHANGE)
        .spawn_with(|request| Some(ResponseEnvelope::ok(request.method.clone(), json!({ "path": request.body["path"], "bytes": 42 }))));

    let stored: Stored = registry
        .client("storage")
        .unwrap()
        .call_as(Method::SAVE_FILE, &json!({ "path": "/tmp/a" }))
        .await
        .unwrap();

    assert_eq!(stored, Stored { path: "/tmp/a".into(), bytes: 42 });
}

#[tokio::test(start_paused = true)]
async fn remote_error_becomes_application_error() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["storage"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("storage"), TEST_EXCHANGE)
        .spawn_with(|request| Some(ResponseEnvelope::error(request.method.clone(), "disk full")));

    let err = registry
        .client("storage")
        .unwrap()
        .call(Method::SAVE_FILE, &json!({ "path": "/tmp/a" }))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RpcError::Application {
            method: Method::SAVE_FILE,
            message: "disk full".into(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_then_late_response_is_dropped() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), TEST_EXCHANGE)
        .with_delay(Duration::from_secs(3))
        .spawn();
    let client = registry.client("sender").unwrap();
    let started = Instant::now();

    let err = client
        .call_with_timeout(Method::SEND_NOTIFICATION, &json!({ "n": 1 }), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Timeout { ref method, .. } if *method == Method::SEND_NOTIFICATION));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));

    // The first reply lands at 3 s and must not satisfy the second call
    let response = client
        .call_with_timeout(Method::SEND_NOTIFICATION, &json!({ "n": 2 }), Duration::from_secs(10))
        .await
        .unwrap();

    assert_eq!(response.data, json!({ "n": 2 }));
    assert!(registry.get_or_create("sender").unwrap().table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn responses_never_cross_domains() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender", "payments"]).await;
    let sender = registry.client("sender").unwrap();

    let call = tokio::spawn(async move {
        sender
            .call_with_timeout(Method::SEND_EMAIL, &json!({}), Duration::from_secs(30))
            .await
    });

    let published = wait_for_published(&broker, "sender_requests_rk", 1).await;
    let token = published[0].message.correlation_id.clone().unwrap();
    let response = ResponseEnvelope::ok(Method::SEND_EMAIL, json!("sent"));

    // Routed to the payments response queue: payments has no such id
    assert_eq!(broker.deliver(TEST_EXCHANGE, "payments_responses_rk", reply(&token, &response)), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());
    assert_eq!(registry.get_or_create("sender").unwrap().table().len(), 1);

    broker.deliver(TEST_EXCHANGE, "sender_responses_rk", reply(&token, &response));
    let response = call.await.unwrap().unwrap();
    assert_eq!(response.data, json!("sent"));
    assert!(registry.get_or_create("payments").unwrap().table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stray_deliveries_do_not_disturb_pending_calls() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    let sender = registry.client("sender").unwrap();

    let call = tokio::spawn(async move {
        sender
            .call_with_timeout(Method::READ_FILE, &json!({ "path": "/a" }), Duration::from_secs(30))
            .await
    });
    let published = wait_for_published(&broker, "sender_requests_rk", 1).await;
    let token = published[0].message.correlation_id.clone().unwrap();
    let ok = ResponseEnvelope::ok(Method::READ_FILE, json!("contents"));

    // No correlation id, unknown id, and an undecodable body for an unknown id
    broker.deliver(
        TEST_EXCHANGE,
        "sender_responses_rk",
        BrokerMessage {
            correlation_id: None,
            ..reply("ignored", &ok)
        },
    );
    broker.deliver(TEST_EXCHANGE, "sender_responses_rk", reply("someone-else", &ok));
    broker.deliver(
        TEST_EXCHANGE,
        "sender_responses_rk",
        BrokerMessage {
            content_type: Some("remote|read_file".into()),
            correlation_id: Some("garbage".into()),
            payload: b"not json".to_vec(),
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());

    broker.deliver(TEST_EXCHANGE, "sender_responses_rk", reply(&token, &ok));
    assert_eq!(call.await.unwrap().unwrap().data, json!("contents"));
}

#[tokio::test(start_paused = true)]
async fn malformed_response_fails_the_matching_call() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    let sender = registry.client("sender").unwrap();

    let call = tokio::spawn(async move {
        sender
            .call_with_timeout(Method::READ_FILE, &json!({}), Duration::from_secs(30))
            .await
    });
    let published = wait_for_published(&broker, "sender_requests_rk", 1).await;
    let token = published[0].message.correlation_id.clone().unwrap();

    broker.deliver(
        TEST_EXCHANGE,
        "sender_responses_rk",
        BrokerMessage {
            content_type: Some("remote|read_file".into()),
            correlation_id: Some(token.clone()),
            payload: br#"{"status":"maybe"}"#.to_vec(),
        },
    );

    match call.await.unwrap() {
        Err(RpcError::MalformedResponse { correlation_id, .. }) => {
            assert_eq!(correlation_id.as_str(), token);
        }
        other => panic!("expected malformed response, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn publishes_are_paced_and_served_in_order() {
    let broker = InMemoryBroker::new();
    let rpc = RpcSettings::default().with_publish_pacing(Duration::from_millis(1500));
    let registry = started(&broker, rpc, &["sender"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), TEST_EXCHANGE).spawn();
    let started = Instant::now();

    let mut calls = Vec::new();
    for n in 0..3 {
        let client = registry.client("sender").unwrap();
        calls.push(tokio::spawn(async move { client.call(Method::SEND_EMAIL, &json!({ "n": n })).await }));
        tokio::task::yield_now().await;
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    let order: Vec<Value> = broker
        .published_to("sender_requests_rk")
        .iter()
        .map(|published| body(published)["n"].clone())
        .collect();
    assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
    assert!(started.elapsed() >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn time_queued_at_the_gate_counts_toward_the_timeout() {
    let broker = InMemoryBroker::new();
    let rpc = RpcSettings::default().with_publish_pacing(Duration::from_millis(1500));
    let registry = started(&broker, rpc, &["sender"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), TEST_EXCHANGE).spawn();
    let started = Instant::now();

    let mut calls = Vec::new();
    for n in 0..3 {
        let client = registry.client("sender").unwrap();
        calls.push(tokio::spawn(async move {
            client
                .call_with_timeout(Method::SEND_EMAIL, &json!({ "n": n }), Duration::from_secs(2))
                .await
        }));
        tokio::task::yield_now().await;
    }
    let mut outcomes = Vec::new();
    for call in calls {
        outcomes.push(call.await.unwrap());
    }

    // The third call would only be admitted at 3s
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_ok());
    assert!(matches!(outcomes[2], Err(RpcError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(broker.published_to("sender_requests_rk").len(), 2);
    assert!(registry.get_or_create("sender").unwrap().table().is_empty());
}

async fn peak_publishes_with_concurrency(concurrency: usize) -> usize {
    let broker = InMemoryBroker::new();
    broker.set_publish_delay(Duration::from_millis(100));
    let registry = started(&broker, unpaced().with_publish_concurrency(concurrency), &["sender"]).await;
    let _responder = EchoResponder::new(&broker, &DomainSpec::for_domain("sender"), TEST_EXCHANGE).spawn();

    let mut calls = Vec::new();
    for n in 0..5 {
        let client = registry.client("sender").unwrap();
        calls.push(tokio::spawn(async move { client.call(Method::SEND_EMAIL, &json!({ "n": n })).await }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(broker.published_to("sender_requests_rk").len(), 5);
    broker.max_in_flight_publishes()
}

#[tokio::test(start_paused = true)]
async fn single_permit_gate_serializes_publishes() {
    assert_eq!(peak_publishes_with_concurrency(1).await, 1);
}

#[tokio::test(start_paused = true)]
async fn wider_gate_allows_overlapping_publishes() {
    assert_eq!(peak_publishes_with_concurrency(3).await, 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_publish_surfaces_and_leaves_no_pending_entry() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    broker.fail_next_publishes(1);

    let err = registry
        .client("sender")
        .unwrap()
        .call(Method::SEND_EMAIL, &json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Publish { .. }));
    assert!(registry.get_or_create("sender").unwrap().table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn calls_before_start_fail_fast() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker, unpaced());

    let err = registry
        .client("sender")
        .unwrap()
        .call(Method::SEND_EMAIL, &json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Channel { .. }));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_access_creates_one_bundle() {
    let broker = InMemoryBroker::new();
    let registry = Arc::new(registry(&broker, unpaced()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_create("payments").unwrap() })
        })
        .collect();

    let mut bundles = Vec::new();
    for handle in handles {
        bundles.push(handle.await.unwrap());
    }

    assert!(bundles.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(registry.domains().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn registered_layout_is_used_for_new_domains() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker, unpaced());

    assert!(registry.register_domain(DomainSpec::new("billing", "billing_in", "billing_out")));
    registry.start_listening("billing").await.unwrap();

    assert!(broker.has_binding("billing_in", TEST_EXCHANGE, "billing_in_rk"));
    assert!(broker.has_binding("billing_out", TEST_EXCHANGE, "billing_out_rk"));
    assert!(!registry.register_domain(DomainSpec::for_domain("billing")));
    assert_eq!(registry.get_or_create("billing").unwrap().spec().request_queue, "billing_in");
}

#[tokio::test(start_paused = true)]
async fn shutdown_rejects_pending_and_new_calls() {
    let broker = InMemoryBroker::new();
    let registry = started(&broker, unpaced(), &["sender"]).await;
    let sender = registry.client("sender").unwrap();

    let pending = {
        let sender = sender.clone();
        tokio::spawn(async move { sender.call(Method::SEND_EMAIL, &json!({})).await })
    };
    wait_for_published(&broker, "sender_requests_rk", 1).await;

    registry.shutdown().await;

    assert!(matches!(pending.await.unwrap(), Err(RpcError::DomainUnavailable(_))));
    assert!(matches!(
        sender.call(Method::SEND_EMAIL, &json!({})).await,
        Err(RpcError::DomainUnavailable(_))
    ));
    assert_eq!(broker.open_links(), 0);
}
