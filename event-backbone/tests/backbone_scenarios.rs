//! End-to-end behaviour of the backbone against the in-memory broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use event_backbone::broker::Connector;
use event_backbone::config::FailurePolicyKind;
use event_backbone::memory::InMemoryBroker;
use event_backbone::rpc::Correlated;
use event_backbone::topology::{ExchangeKind, ExchangeSpec};
use event_backbone::{
    decode_payload, BackboneConfig, ConnectionState, EventBackbone, EventBusError, HandlerRegistry,
    PendingResponses, Topology,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

const QUEUE: &str = "svc-events";

fn config() -> BackboneConfig {
    BackboneConfig {
        uri: "amqp://memory".into(),
        service_name: "svc".into(),
        ..BackboneConfig::default()
    }
}

fn topology(config: &BackboneConfig) -> Topology {
    config
        .topology_builder()
        .topic_exchange("profile-events")
        .topic_exchange("auth-events")
        .bind("profile-events", "profile.#")
        .bind("auth-events", "google.login.#")
        .build()
        .unwrap()
}

async fn connect(broker: &InMemoryBroker, config: BackboneConfig) -> EventBackbone {
    let topology = topology(&config);
    EventBackbone::connect_with(config, topology, Arc::new(broker.clone())).await.unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_connected_above(backbone: &EventBackbone, generation: u64) {
    let mut status = backbone.supervisor().unwrap().subscribe_status();
    status
        .wait_for(|s| s.state == ConnectionState::Connected && s.generation > generation)
        .await
        .unwrap();
}

fn counting_handler(counter: &Arc<AtomicUsize>) -> impl Fn(Vec<u8>) -> futures::future::Ready<event_backbone::Result<()>> {
    let counter = Arc::clone(counter);
    move |_body| {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn disabled_backbone_never_touches_the_broker() {
    let broker = InMemoryBroker::new();
    let config = BackboneConfig::default();
    let topology = topology(&config);
    let backbone = EventBackbone::connect_with(config, topology, Arc::new(broker.clone())).await.unwrap();

    assert!(!backbone.is_enabled());
    assert_eq!(backbone.state(), ConnectionState::Disconnected);
    backbone
        .publisher()
        .publish_event("profile-events", "profile.updated", json!({"username": "alice"}))
        .await
        .unwrap();
    backbone.start_consumer(HandlerRegistry::new()).await.unwrap();
    backbone.close().await.unwrap();

    let stats = broker.stats();
    assert_eq!(stats.connects, 0);
    assert_eq!(stats.publishes, 0);
    assert!(broker.declarations().is_empty());
}

#[tokio::test]
async fn unknown_routing_keys_are_acked_without_stalling() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", counting_handler(&handled)))
        .await
        .unwrap();

    broker.inject("profile-events", "profile.renamed", br#"{"username":"alice"}"#.to_vec()).unwrap();
    broker.inject("profile-events", "profile.updated", br#"{"username":"alice"}"#.to_vec()).unwrap();

    eventually("both deliveries settled", || {
        handled.load(Ordering::SeqCst) == 1 && broker.unacked_count(QUEUE) == 0 && broker.queue_depth(QUEUE) == 0
    })
    .await;
    backbone.close().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_still_settles_its_delivery() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, BackboneConfig { prefetch: 1, workers: 1, ..config() }).await;
    let handled = Arc::new(AtomicUsize::new(0));
    let registry = HandlerRegistry::new()
        .register_fn("profile.deleted", |_body: Vec<u8>| -> futures::future::Ready<event_backbone::Result<()>> {
            panic!("profile store exploded")
        })
        .register_fn("profile.updated", counting_handler(&handled));
    backbone.start_consumer(registry).await.unwrap();

    broker.inject("profile-events", "profile.deleted", br#"{"username":"alice"}"#.to_vec()).unwrap();
    broker.inject("profile-events", "profile.updated", br#"{"username":"alice"}"#.to_vec()).unwrap();

    eventually("dispatch continued past the panic", || {
        handled.load(Ordering::SeqCst) == 1 && broker.unacked_count(QUEUE) == 0 && broker.queue_depth(QUEUE) == 0
    })
    .await;
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outage_recovery_redeclares_the_same_topology() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let initial = broker.declarations();
    broker.clear_declarations();

    broker.simulate_outage();
    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.restore();
    let restored_at = Instant::now();
    wait_connected_above(&backbone, 1).await;

    assert!(restored_at.elapsed() <= Duration::from_secs(30));
    assert_eq!(broker.declarations(), initial);
    assert!(broker.stats().failed_connects >= 2);
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dispatch_resumes_after_outage() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", counting_handler(&handled)))
        .await
        .unwrap();

    broker.simulate_outage();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = backbone
        .publisher()
        .publish_event("profile-events", "profile.updated", json!({"username": "alice"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::ConnectionUnavailable));

    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.restore();
    wait_connected_above(&backbone, 1).await;

    backbone
        .publisher()
        .publish_event("profile-events", "profile.updated", json!({"username": "alice"}))
        .await
        .unwrap();
    eventually("delivery after recovery", || handled.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.consumer_count(QUEUE), 1);
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn channel_close_reopens_without_reconnecting() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", counting_handler(&handled)))
        .await
        .unwrap();

    broker.close_channels();
    wait_connected_above(&backbone, 1).await;
    broker.inject("profile-events", "profile.updated", b"{}".to_vec()).unwrap();

    eventually("delivery on reopened channel", || handled.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.stats().connects, 1);
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_consumer_resubscribes() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let handled = Arc::new(AtomicUsize::new(0));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", counting_handler(&handled)))
        .await
        .unwrap();

    broker.cancel_consumers(QUEUE);
    assert_eq!(broker.consumer_count(QUEUE), 0);
    eventually("consumer back on the queue", || broker.consumer_count(QUEUE) == 1).await;

    broker.inject("profile-events", "profile.updated", b"{}".to_vec()).unwrap();
    eventually("delivery after resubscribe", || handled.load(Ordering::SeqCst) == 1).await;
    backbone.close().await.unwrap();
}

#[tokio::test]
async fn requeue_policy_dead_letters_after_retry_cap() {
    let broker = InMemoryBroker::new();
    let config = BackboneConfig {
        failure_policy: FailurePolicyKind::Requeue,
        max_retries: 2,
        dead_letter_exchange: Some("svc.dlx".into()),
        ..config()
    };
    let backbone = connect(&broker, config).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.deleted", move |_body| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(EventBusError::Handler(anyhow::anyhow!("profile store unavailable"))) }
        }))
        .await
        .unwrap();

    broker.inject("profile-events", "profile.deleted", br#"{"user_id":"u1"}"#.to_vec()).unwrap();

    eventually("dead-lettered", || broker.queue_depth("svc-events.dead-letter") == 1).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    backbone.close().await.unwrap();
}

#[tokio::test]
async fn malformed_bodies_are_dropped_even_with_requeue_policy() {
    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct ProfileDeleted {
        user_id: String,
    }

    let broker = InMemoryBroker::new();
    let config = BackboneConfig {
        failure_policy: FailurePolicyKind::Requeue,
        dead_letter_exchange: Some("svc.dlx".into()),
        ..config()
    };
    let backbone = connect(&broker, config).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.deleted", move |body| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { decode_payload::<ProfileDeleted>(&body).map(|_| ()) }
        }))
        .await
        .unwrap();

    broker.inject("profile-events", "profile.deleted", b"not json".to_vec()).unwrap();

    eventually("malformed delivery acked", || {
        attempts.load(Ordering::SeqCst) == 1 && broker.unacked_count(QUEUE) == 0
    })
    .await;
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert_eq!(broker.queue_depth("svc-events.dead-letter"), 0);
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_handlers_and_is_idempotent() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (Arc::clone(&started), Arc::clone(&finished));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", move |_body| {
            let (started, finished) = (Arc::clone(&started_flag), Arc::clone(&finished_flag));
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        }))
        .await
        .unwrap();

    broker.inject("profile-events", "profile.updated", b"{}".to_vec()).unwrap();
    eventually("handler started", || started.load(Ordering::SeqCst)).await;

    backbone.close().await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.queue_depth(QUEUE), 0);

    backbone.close().await.unwrap();
    assert_eq!(backbone.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn broker_down_at_startup_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.simulate_outage();
    let config = config();
    let topology = topology(&config);
    let err = EventBackbone::connect_with(config, topology, Arc::new(broker.clone())).await.unwrap_err();
    assert!(matches!(err, EventBusError::Connection(_)));
}

#[tokio::test]
async fn conflicting_exchange_at_startup_is_fatal() {
    let broker = InMemoryBroker::new();
    let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
    let connection = broker.connect("memory", 99, events.clone()).await.unwrap();
    let channel = connection.open_channel(99, events).await.unwrap();
    channel
        .declare_exchange(&ExchangeSpec { name: "profile-events".into(), kind: ExchangeKind::Fanout, durable: true })
        .await
        .unwrap();

    let config = config();
    let topology = topology(&config);
    let err = EventBackbone::connect_with(config, topology, Arc::new(broker.clone())).await.unwrap_err();
    assert!(matches!(err, EventBusError::Topology(_)));
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn worker_pool_is_bounded() {
    let broker = InMemoryBroker::new();
    let config = BackboneConfig { workers: 3, ..config() };
    let backbone = connect(&broker, config).await;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let (a, p, d) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
    backbone
        .start_consumer(HandlerRegistry::new().register_fn("profile.updated", move |_body| {
            let (active, peak, done) = (Arc::clone(&a), Arc::clone(&p), Arc::clone(&d));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
        .await
        .unwrap();

    for _ in 0..12 {
        broker.inject("profile-events", "profile.updated", b"{}".to_vec()).unwrap();
    }
    eventually("all handled", || done.load(Ordering::SeqCst) == 12).await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak > 1, "handlers never overlapped");
    assert!(peak <= 3, "peak concurrency {peak} exceeded the pool");
    backbone.close().await.unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoginRequest {
    request_id: String,
    email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoginResponse {
    request_id: String,
    success: bool,
}

impl Correlated for LoginResponse {
    fn request_id(&self) -> &str {
        &self.request_id
    }
}

#[tokio::test]
async fn correlated_call_round_trips_through_the_broker() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let pending = PendingResponses::<LoginResponse>::new();

    let responder = backbone.publisher();
    let registry = HandlerRegistry::new().register_fn("google.login.request", move |body| {
        let responder = responder.clone();
        async move {
            let request: LoginRequest = decode_payload(&body)?;
            responder
                .publish_event(
                    "auth-events",
                    "google.login.response",
                    LoginResponse { request_id: request.request_id, success: true },
                )
                .await
        }
    });
    let registry = pending.install(registry, "google.login.response");
    backbone.start_consumer(registry).await.unwrap();

    let response = pending
        .call(
            &backbone.publisher(),
            "auth-events",
            "google.login.request",
            "r1",
            LoginRequest { request_id: "r1".into(), email: "a@b.com".into() },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert_eq!(response.request_id, "r1");
    assert!(response.success);
    assert_eq!(pending.pending(), 0);
    backbone.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn correlated_call_times_out_without_responder() {
    let broker = InMemoryBroker::new();
    let backbone = connect(&broker, config()).await;
    let pending = PendingResponses::<LoginResponse>::new();
    backbone
        .start_consumer(pending.install(HandlerRegistry::new(), "google.login.response"))
        .await
        .unwrap();

    let err = pending
        .call(
            &backbone.publisher(),
            "auth-events",
            "google.login.request",
            "r2",
            LoginRequest { request_id: "r2".into(), email: "a@b.com".into() },
            Duration::from_secs(3),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::ResponseTimeout(ref id) if id == "r2"));
    assert_eq!(pending.pending(), 0);
    backbone.close().await.unwrap();
}
