//! E2E tests for inbox intake: authentication, idempotence, listener
//! dispatch and the shared inbox.

mod common;

use common::{TestServer, REMOTE_ACTOR};
use serde_json::json;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn unsigned_inbox_post_is_unauthorized() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/users/john/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": "https://remote.example/activities/unsigned",
            "actor": REMOTE_ACTOR,
        }))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 401);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn signed_post_dispatches_exactly_once() {
    let server = TestServer::new().await;
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/create-1",
        "actor": REMOTE_ACTOR,
        "object": {"type": "Note", "content": "hi"},
    });

    let response = server
        .post_signed_activity("/users/john/inbox", &activity)
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 1);

    // The identical POST again: accepted, not re-dispatched.
    let response = server
        .post_signed_activity("/users/john/inbox", &activity)
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn signed_key_is_memoized_within_the_request() {
    let server = TestServer::new().await;
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/create-memo",
        "actor": REMOTE_ACTOR,
        "object": {"type": "Note", "content": "memo"},
    });

    let loads_before = server.loader.loads.load(Ordering::SeqCst);
    let response = server
        .post_signed_activity("/users/john/inbox", &activity)
        .await;
    assert_eq!(response.status(), 202);

    let observed = server
        .listener_state
        .signed_key_ids
        .lock()
        .expect("signed key lock");
    let (first, second) = observed.last().expect("listener observed the key").clone();
    assert_eq!(first.as_deref(), Some(format!("{REMOTE_ACTOR}#main-key").as_str()));
    assert_eq!(first, second);

    // One verification, one key-document load for the whole request.
    let loads = server.loader.loads.load(Ordering::SeqCst) - loads_before;
    assert_eq!(loads, 1, "signature verification must run once");
}

#[tokio::test]
async fn shared_inbox_accepts_signed_activities() {
    let server = TestServer::new().await;
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/create-shared",
        "actor": REMOTE_ACTOR,
        "object": {"type": "Note", "content": "to everyone"},
    });

    let response = server.post_signed_activity("/inbox", &activity).await;
    assert_eq!(response.status(), 202);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listener_lookup_walks_the_class_chain() {
    let server = TestServer::new().await;

    // Only Create has a listener; a Like is accepted without dispatch.
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Like",
        "id": "https://remote.example/activities/like-1",
        "actor": REMOTE_ACTOR,
        "object": "https://local.test/users/john/notes/42",
    });

    let response = server
        .post_signed_activity("/users/john/inbox", &activity)
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wrong_content_type_is_a_bad_request() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/users/john/inbox"))
        .header("Content-Type", "text/plain")
        .body("{}")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn inbox_is_post_only() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/john/inbox"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 405);
}

#[tokio::test]
async fn inbox_of_unknown_actor_is_not_found() {
    let server = TestServer::new().await;
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/create-jane",
        "actor": REMOTE_ACTOR,
    });

    let response = server
        .post_signed_activity("/users/jane/inbox", &activity)
        .await;
    assert_eq!(response.status(), 404);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn signer_must_match_the_activity_actor() {
    let server = TestServer::new().await;

    // Signed by alice, claiming to be bob.
    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Create",
        "id": "https://remote.example/activities/spoofed",
        "actor": "https://remote.example/users/bob",
        "object": {"type": "Note", "content": "spoof"},
    });

    let response = server
        .post_signed_activity("/users/john/inbox", &activity)
        .await;
    assert_eq!(response.status(), 401);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unparseable_bodies_are_bad_requests() {
    let server = TestServer::new().await;

    // Signed like a real activity, but the body is not an activity.
    let body = json!({"hello": "world"});
    let response = server
        .post_signed_activity("/users/john/inbox", &body)
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(server.listener_state.calls.load(Ordering::SeqCst), 0);
}
