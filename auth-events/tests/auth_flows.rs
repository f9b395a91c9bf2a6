//! Auth handlers driven through the backbone and the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use auth_events::events::{GoogleLoginResponse, UserRegistered};
use auth_events::requester::google_topology;
use auth_events::{AuthEventWorker, AuthStores, GoogleIdentity, GoogleLoginClient, InMemoryAuthStore};
use event_backbone::memory::InMemoryBroker;
use event_backbone::{decode_payload, BackboneConfig, EventBackbone, HandlerRegistry};
use serde_json::json;

const AUTH_QUEUE: &str = "auth-service-events";
const CAPTURE_QUEUE: &str = "capture-service-events";

fn config(service: &str) -> BackboneConfig {
    BackboneConfig { uri: "amqp://memory".into(), service_name: service.into(), ..BackboneConfig::default() }
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

struct Harness {
    broker: InMemoryBroker,
    store: Arc<InMemoryAuthStore>,
    worker: AuthEventWorker,
    google: EventBackbone,
    client: GoogleLoginClient,
    profiles: EventBackbone,
}

impl Harness {
    async fn start() -> Self {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryAuthStore::new().with_permissions(["quiz:create"]));
        let worker = AuthEventWorker::start_with(
            config("auth-service"),
            AuthStores::in_memory(store.clone()),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();

        let google_config = config("google-service");
        let topology = google_topology(&google_config).unwrap();
        let google = EventBackbone::connect_with(google_config, topology, Arc::new(broker.clone())).await.unwrap();
        let client = GoogleLoginClient::with_timeout(google.publisher(), Duration::from_secs(2));
        google.start_consumer(client.install(HandlerRegistry::new())).await.unwrap();

        // Registration announcements land here and stay queued.
        let profile_config = config("profile-service");
        let topology = profile_config
            .topology_builder()
            .topic_exchange("user-events")
            .bind("user-events", "user.registered")
            .build()
            .unwrap();
        let profiles = EventBackbone::connect_with(profile_config, topology, Arc::new(broker.clone())).await.unwrap();

        Self { broker, store, worker, google, client, profiles }
    }

    async fn close(self) {
        self.google.close().await.unwrap();
        self.profiles.close().await.unwrap();
        self.worker.close().await.unwrap();
    }
}

/// A consumer-less queue collecting every `google.login.response`.
async fn capture_responses(broker: &InMemoryBroker) -> EventBackbone {
    let config = config("capture-service");
    let topology = config
        .topology_builder()
        .topic_exchange("auth-events")
        .bind("auth-events", "google.login.response")
        .build()
        .unwrap();
    EventBackbone::connect_with(config, topology, Arc::new(broker.clone())).await.unwrap()
}

async fn raw_login_request(harness: &Harness, capture: &EventBackbone) -> GoogleLoginResponse {
    harness
        .broker
        .inject("google.events", "google.login.request", br#"{"request_id":"r1","email":"a@b.com"}"#.to_vec())
        .unwrap();
    eventually("request settled", || {
        harness.broker.unacked_count(AUTH_QUEUE) == 0
            && harness.broker.queue_depth(AUTH_QUEUE) == 0
            && harness.broker.queue_depth(CAPTURE_QUEUE) > 0
    })
    .await;

    let responses = harness.broker.take_messages(CAPTURE_QUEUE);
    assert_eq!(responses.len(), 1);
    capture.close().await.unwrap();
    decode_payload(&responses[0].body).unwrap()
}

fn identity(email: &str) -> GoogleIdentity {
    GoogleIdentity {
        google_id: "g-42".into(),
        email: email.into(),
        verified_email: true,
        name: "Frank Ocean".into(),
        locale: "en".into(),
        ..GoogleIdentity::default()
    }
}

fn is_session_token(token: &str) -> bool {
    match token.split_once('-') {
        Some((stamp, suffix)) => {
            stamp.len() == 14
                && stamp.chars().all(|c| c.is_ascii_digit())
                && suffix.len() == 32
                && suffix.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

#[tokio::test]
async fn google_login_round_trip_registers_once() {
    let harness = Harness::start().await;

    let first = harness.client.login(identity("frank@example.com")).await.unwrap();
    assert!(first.success);
    assert!(is_session_token(first.session_token.as_deref().unwrap()));
    let user_id = first.user_id.clone().unwrap();

    let second = harness.client.login(identity("frank@example.com")).await.unwrap();
    assert!(second.success);
    assert_eq!(second.user_id.as_deref(), Some(user_id.as_str()));
    assert_ne!(second.session_token, first.session_token);

    assert_eq!(harness.store.user_count(), 1);
    assert_eq!(harness.store.session_count(), 2);
    let (session, ttl) = harness.store.session(first.session_token.as_deref().unwrap()).unwrap();
    assert_eq!(ttl, Duration::from_secs(24 * 60 * 60));
    assert_eq!(session.user_id.to_string(), user_id);

    let announcements = harness.broker.take_messages("profile-service-events");
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0].routing_key, "user.registered");
    let registered: UserRegistered = decode_payload(&announcements[0].body).unwrap();
    assert_eq!(registered.user_id, user_id);
    assert_eq!(registered.profile_data["provider"], "google");
    assert_eq!(harness.client.pending(), 0);

    harness.close().await;
}

#[tokio::test]
async fn failed_user_creation_answers_with_error() {
    let harness = Harness::start().await;
    harness.store.fail_user_creation(true);

    let response = harness.client.login(identity("gina@example.com")).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("Failed to create user"));
    assert!(response.session_token.is_none());
    eventually("failed request settled", || harness.broker.unacked_count(AUTH_QUEUE) == 0).await;
    assert_eq!(harness.broker.queue_depth(AUTH_QUEUE), 0);

    harness.close().await;
}

#[tokio::test]
async fn failed_session_write_reports_user() {
    let harness = Harness::start().await;
    harness.store.fail_session_writes(true);

    let response = harness.client.login(identity("hank@example.com")).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("Failed to create session"));
    assert!(response.user_id.is_some());
    assert_eq!(harness.store.user_count(), 1);

    harness.close().await;
}

#[tokio::test]
async fn billing_events_manage_plan_roles() {
    let harness = Harness::start().await;
    let plan = json!({
        "eventType": "plan.created",
        "planId": "p-1",
        "planName": "Premium",
        "roleMetadata": {
            "suggestedRoleName": "premium-plan-role",
            "allPermissions": ["quiz:create", "quiz:teleport"],
            "featurePermissionMap": {},
            "roleDescription": "Premium plan"
        }
    });
    harness
        .google
        .publisher()
        .publish_event("billing.events", "plan.created", plan.clone())
        .await
        .unwrap();
    eventually("role created", || harness.store.role_named("premium-plan-role").is_some()).await;
    assert_eq!(harness.store.role_named("premium-plan-role").unwrap().permissions, vec!["quiz:create"]);

    harness.google.publisher().publish_event("billing.events", "plan.deleted", plan).await.unwrap();
    eventually("role deleted", || harness.store.role_named("premium-plan-role").is_none()).await;

    harness.close().await;
}

#[tokio::test]
async fn malformed_events_are_dropped() {
    let harness = Harness::start().await;
    harness.store.cache_key("user-profile:ivy");

    harness.broker.inject("profile-events", "profile.updated", b"{{{".to_vec()).unwrap();
    harness
        .broker
        .inject("profile-events", "profile.updated", br#"{"user_id":"u-9","username":"ivy"}"#.to_vec())
        .unwrap();

    eventually("valid update applied", || !harness.store.is_cached("user-profile:ivy")).await;
    eventually("queue drained", || {
        harness.broker.unacked_count(AUTH_QUEUE) == 0 && harness.broker.queue_depth(AUTH_QUEUE) == 0
    })
    .await;

    harness.close().await;
}

#[tokio::test]
async fn worker_without_broker_uri_stays_offline() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryAuthStore::new());
    let worker = AuthEventWorker::start_with(
        BackboneConfig { service_name: "auth-service".into(), ..BackboneConfig::default() },
        AuthStores::in_memory(store),
        Arc::new(broker.clone()),
    )
    .await
    .unwrap();

    assert!(!worker.backbone().is_enabled());
    assert_eq!(broker.stats().connects, 0);
    worker.close().await.unwrap();
}

#[tokio::test]
async fn injected_login_request_gets_exactly_one_response() {
    let harness = Harness::start().await;
    let capture = capture_responses(&harness.broker).await;

    let response = raw_login_request(&harness, &capture).await;
    assert_eq!(response.request_id, "r1");
    assert!(response.success);
    assert!(response.session_token.is_some());
    assert_eq!(harness.store.user_count(), 1);

    harness.close().await;
}

#[tokio::test]
async fn injected_login_request_failure_gets_exactly_one_response() {
    let harness = Harness::start().await;
    harness.store.fail_user_creation(true);
    let capture = capture_responses(&harness.broker).await;

    let response = raw_login_request(&harness, &capture).await;
    assert_eq!(response.request_id, "r1");
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("Failed to create user"));
    assert_eq!(harness.store.user_count(), 0);

    harness.close().await;
}

#[tokio::test]
async fn profile_update_is_acked_when_cache_delete_fails() {
    let harness = Harness::start().await;
    harness.store.cache_key("user-profile:alice");
    harness.store.fail_cache_deletes(true);

    harness.broker.inject("profile-events", "profile.updated", br#"{"username":"alice"}"#.to_vec()).unwrap();
    eventually("failed update settled", || {
        harness.store.cache_delete_attempts() == 1
            && harness.broker.unacked_count(AUTH_QUEUE) == 0
            && harness.broker.queue_depth(AUTH_QUEUE) == 0
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.store.cache_delete_attempts(), 1);
    assert!(harness.store.is_cached("user-profile:alice"));

    harness.close().await;
}
