//! E2E tests for outbound delivery: signing, fan-out, queueing and the
//! retry schedule.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::test_keypair;
use http::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use url::Url;

use fedistry::{
    Activity, ActivityClass, Federation, FederationOptions, InProcessQueue, MemoryKvStore,
    SendActivityOptions, SenderKey,
};

/// One POST the receiver saw
struct Received {
    at: Instant,
    headers: http::HeaderMap,
    body: Vec<u8>,
}

/// Serve a catch-all inbox answering `status` to every POST
async fn spawn_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<Received>>>) {
    let log: Arc<Mutex<Vec<Received>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();

    let app = axum::Router::new().fallback(axum::routing::any(
        move |request: axum::extract::Request| {
            let sink = sink.clone();
            async move {
                let (parts, body) = request.into_parts();
                let bytes = axum::body::to_bytes(body, usize::MAX)
                    .await
                    .unwrap_or_default();
                sink.lock().expect("receiver log").push(Received {
                    at: Instant::now(),
                    headers: parts.headers,
                    body: bytes.to_vec(),
                });
                status
            }
        },
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = format!("http://{}", listener.local_addr().expect("local addr"));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, log)
}

fn recipient(inbox: &str) -> Value {
    json!({
        "id": "https://peer.example/users/someone",
        "type": "Person",
        "inbox": inbox,
    })
}

fn sender_key() -> (Url, String) {
    let (private_pem, _) = test_keypair();
    (
        Url::parse("https://local.test/users/john#main-key").expect("key id"),
        private_pem.clone(),
    )
}

struct DeliveryHarness {
    federation: Arc<Federation<()>>,
    outbox_errors: Arc<AtomicUsize>,
}

fn delivery_harness(backoff: Vec<Duration>) -> DeliveryHarness {
    common::init_tracing();
    let outbox_errors = Arc::new(AtomicUsize::new(0));
    let seen = outbox_errors.clone();

    let mut options = FederationOptions::new(Arc::new(MemoryKvStore::new()));
    options.queue = Some(Arc::new(InProcessQueue::new()));
    options.backoff_schedule = Some(backoff);
    options.on_outbox_error = Some(Arc::new(move |_error, _activity| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    DeliveryHarness {
        federation: Arc::new(Federation::new(options)),
        outbox_errors,
    }
}

async fn wait_for_requests(log: &Arc<Mutex<Vec<Received>>>, count: usize, timeout: Duration) {
    let start = Instant::now();
    while log.lock().expect("receiver log").len() < count && start.elapsed() < timeout {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn immediate_delivery_signs_and_posts_json_ld() {
    let harness = delivery_harness(vec![]);
    let (addr, log) = spawn_receiver(StatusCode::ACCEPTED).await;
    let (key_id, private_pem) = sender_key();

    let activity = Activity::build(
        ActivityClass::Create,
        json!({
            "actor": "https://local.test/users/john",
            "object": {"type": "Note", "content": "hello"},
        }),
    );
    harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &[recipient(&format!("{addr}/inbox"))],
            activity,
            SendActivityOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .await
        .expect("delivery succeeds");

    let log = log.lock().expect("receiver log");
    assert_eq!(log.len(), 1);
    let request = &log[0];
    assert_eq!(
        request
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/ld+json")
    );
    let signature = request
        .headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    assert!(signature.contains("keyId=\"https://local.test/users/john#main-key\""));
    assert!(signature.contains("algorithm=\"rsa-sha256\""));
    assert!(signature.contains("digest"));
    assert!(request.headers.get("digest").is_some());
    assert!(request.headers.get("date").is_some());

    let body: Value = serde_json::from_slice(&request.body).expect("JSON body");
    assert_eq!(body["@context"], "https://www.w3.org/ns/activitystreams");
    assert!(body["id"]
        .as_str()
        .is_some_and(|id| id.starts_with("urn:uuid:")));
    assert_eq!(body["type"], "Create");
}

#[tokio::test]
async fn queued_delivery_reaches_the_inbox() {
    let harness = delivery_harness(vec![Duration::from_millis(100)]);
    let (addr, log) = spawn_receiver(StatusCode::ACCEPTED).await;
    let (key_id, private_pem) = sender_key();

    let activity = Activity::build(
        ActivityClass::Announce,
        json!({
            "id": "https://local.test/activities/queued-1",
            "actor": "https://local.test/users/john",
            "object": "https://peer.example/notes/1",
        }),
    );
    harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &[recipient(&format!("{addr}/inbox"))],
            activity,
            SendActivityOptions::default(),
        )
        .await
        .expect("enqueue succeeds");

    wait_for_requests(&log, 1, Duration::from_secs(3)).await;
    let log = log.lock().expect("receiver log");
    assert_eq!(log.len(), 1);
    assert_eq!(harness.outbox_errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_delivery_follows_the_backoff_schedule() {
    let backoff = vec![Duration::from_millis(100), Duration::from_millis(200)];
    let harness = delivery_harness(backoff);
    let (addr, log) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let (key_id, private_pem) = sender_key();

    let activity = Activity::build(
        ActivityClass::Create,
        json!({
            "id": "https://local.test/activities/doomed",
            "actor": "https://local.test/users/john",
            "object": {"type": "Note", "content": "never arrives"},
        }),
    );
    harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &[recipient(&format!("{addr}/inbox"))],
            activity,
            SendActivityOptions::default(),
        )
        .await
        .expect("enqueue succeeds");

    // Trials 0, 1 and 2, then nothing.
    wait_for_requests(&log, 3, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let log = log.lock().expect("receiver log");
    assert_eq!(log.len(), 3, "1 + len(backoff) attempts");
    assert_eq!(harness.outbox_errors.load(Ordering::SeqCst), 3);

    let gap1 = log[1].at.duration_since(log[0].at);
    let gap2 = log[2].at.duration_since(log[1].at);
    assert!(gap1 >= Duration::from_millis(80), "first retry after ~100ms, got {gap1:?}");
    assert!(gap2 >= Duration::from_millis(160), "second retry after ~200ms, got {gap2:?}");

    // Every attempt carried the same activity id.
    let ids: Vec<String> = log
        .iter()
        .map(|r| {
            serde_json::from_slice::<Value>(&r.body).expect("JSON body")["id"]
                .as_str()
                .expect("id")
                .to_string()
        })
        .collect();
    assert!(ids.iter().all(|id| id == "https://local.test/activities/doomed"));
}

#[tokio::test]
async fn shared_inbox_fan_out_collapses_to_one_post() {
    let harness = delivery_harness(vec![]);
    let (addr, log) = spawn_receiver(StatusCode::ACCEPTED).await;
    let (key_id, private_pem) = sender_key();

    let shared = format!("{addr}/inbox");
    let recipients: Vec<Value> = (1..=2)
        .map(|i| {
            json!({
                "id": format!("https://peer.example/users/u{i}"),
                "type": "Person",
                "inbox": format!("{addr}/users/u{i}/inbox"),
                "endpoints": {"sharedInbox": shared},
            })
        })
        .collect();

    let activity = Activity::build(
        ActivityClass::Create,
        json!({
            "id": "https://local.test/activities/fanout",
            "actor": "https://local.test/users/john",
            "object": {"type": "Note", "content": "once"},
        }),
    );
    harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &recipients,
            activity,
            SendActivityOptions {
                prefer_shared_inbox: true,
                immediate: true,
            },
        )
        .await
        .expect("delivery succeeds");

    let log = log.lock().expect("receiver log");
    assert_eq!(log.len(), 1, "both recipients share one inbox");
}

#[tokio::test]
async fn sending_requires_an_actor() {
    let harness = delivery_harness(vec![]);
    let (addr, log) = spawn_receiver(StatusCode::ACCEPTED).await;
    let (key_id, private_pem) = sender_key();

    let activity = Activity::build(
        ActivityClass::Create,
        json!({"object": {"type": "Note", "content": "anonymous"}}),
    );
    let error = harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &[recipient(&format!("{addr}/inbox"))],
            activity,
            SendActivityOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .await
        .expect_err("actorless activities are refused");
    assert!(error.to_string().contains("actor"));

    // Refused before any network I/O.
    assert!(log.lock().expect("receiver log").is_empty());
}

#[tokio::test]
async fn sending_to_nobody_is_a_no_op() {
    let harness = delivery_harness(vec![]);
    let (key_id, private_pem) = sender_key();

    let activity = Activity::build(
        ActivityClass::Create,
        json!({
            "actor": "https://local.test/users/john",
            "object": {"type": "Note", "content": "void"},
        }),
    );
    harness
        .federation
        .send_activity(
            &key_id,
            &private_pem,
            &[],
            activity,
            SendActivityOptions::default(),
        )
        .await
        .expect("empty recipient set is fine");
}

#[tokio::test]
async fn context_send_resolves_handle_senders() {
    common::init_tracing();
    let (addr, log) = spawn_receiver(StatusCode::ACCEPTED).await;
    let (private_pem, public_pem) = test_keypair().clone();

    let mut options = FederationOptions::new(Arc::new(MemoryKvStore::new()));
    options.queue = None; // no queue: sends are immediate
    let mut federation: Federation<()> = Federation::new(options);
    federation
        .set_actor_dispatcher("/users/{handle}", |_ctx, _handle, _key| async {
            Ok(Some(json!({"type": "Person"})))
        })
        .expect("actor dispatcher registers")
        .set_key_pair_dispatcher(move |_data, _handle| {
            let pair = fedistry::KeyPair {
                private_key_pem: private_pem.clone(),
                public_key_pem: public_pem.clone(),
            };
            async move { Ok(Some(pair)) }
        });
    let federation = Arc::new(federation);

    let ctx = federation.context(Url::parse("https://local.test/").expect("url"), ());
    let activity = Activity::build(
        ActivityClass::Follow,
        json!({
            "actor": "https://local.test/users/john",
            "object": "https://peer.example/users/someone",
        }),
    );
    ctx.send_activity(
        &SenderKey::Handle("john".to_string()),
        &[recipient(&format!("{addr}/inbox"))],
        activity,
        SendActivityOptions::default(),
    )
    .await
    .expect("send succeeds");

    let log = log.lock().expect("receiver log");
    assert_eq!(log.len(), 1);
    let signature = log[0]
        .headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    assert!(signature.contains("keyId=\"https://local.test/users/john#main-key\""));
}
