mod common;

use axum::http::{Method, StatusCode};
use common::{
    build_state, count_rows, data_exchange, eventually, send, test_pool, FakeChatDirectory,
    FakeRelay, Peer,
};
use flowbridge_server::api_flow::LIVENESS_TEXT;
use flowbridge_server::app;
use flowbridge_types::SUCCESS_SCREEN;
use serde_json::{json, Value};
use std::sync::Arc;

fn error_of(body: &str) -> String {
    let json: Value = serde_json::from_str(body).expect("error body should be JSON");
    json["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn get_reports_liveness() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(&app, Method::GET, "/api/flow", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, LIVENESS_TEXT);
}

#[tokio::test]
async fn other_methods_are_rejected() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(&app, Method::PUT, "/api/flow", Some(json!({}))).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_of(&body), "method not allowed");
}

#[tokio::test]
async fn health_reports_version() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, false, None, None));

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn plain_ping_gets_plain_status() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let ping = json!({"action": "ping"});
    let (status, body) = send(&app, Method::POST, "/api/flow", Some(ping)).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json, json!({"data": {"status": "active"}}));
}

#[tokio::test]
async fn missing_envelope_fields_are_bad_requests() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(json!({"encrypted_aes_key": "abc", "initial_vector": "def"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "invalid request format");

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(json!({"encrypted_aes_key": "", "encrypted_flow_data": "x", "initial_vector": "y"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undecryptable_envelope_is_misdirected() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(json!({
            "encrypted_aes_key": "bm90IGEga2V5",
            "encrypted_flow_data": "bm90IGRhdGE=",
            "initial_vector": "AAAAAAAAAAAAAAAAAAAAAA==",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
    assert_eq!(error_of(&body), "failed to decrypt request");
}

#[tokio::test]
async fn tampered_ciphertext_is_misdirected() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let mut envelope = Peer::new().envelope(&json!({"action": "ping"}));
    envelope["encrypted_flow_data"] = json!("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");

    let (status, _) = send(&app, Method::POST, "/api/flow", Some(envelope)).await;
    assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
}

#[tokio::test]
async fn missing_private_key_is_a_configuration_error() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, false, None, None));
    let peer = Peer::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&json!({"action": "ping"}))),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_of(&body), "server configuration error");
}

#[tokio::test]
async fn encrypted_ping_touches_no_state() {
    let (_dir, pool) = test_pool();
    let directory = Arc::new(FakeChatDirectory::default());
    let relay = Arc::new(FakeRelay::default());
    let app = app(build_state(&pool, true, Some(directory.clone()), Some(relay.clone())));
    let peer = Peer::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&json!({"action": "ping", "version": "3.0"}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(peer.open_response(&body), json!({"data": {"status": "active"}}));

    assert_eq!(count_rows(&pool, "flow_queue"), 0);
    assert_eq!(count_rows(&pool, "survey_submissions"), 0);
    assert!(directory.notes().is_empty());
    assert!(relay.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));
    let peer = Peer::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&json!({"action": "INIT", "flow_token": "t"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "unknown action");
}

#[tokio::test]
async fn submission_is_resolved_saved_and_announced() {
    let (_dir, pool) = test_pool();
    let directory = Arc::new(FakeChatDirectory::default());
    let relay = Arc::new(FakeRelay::default());
    let app = app(build_state(&pool, true, Some(directory.clone()), Some(relay.clone())));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow/dispatches",
        Some(json!({
            "phone_number": "+212 600 000 001",
            "display_name": "Aicha",
            "conversation_id": 77,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let peer = Peer::new();
    let answers = json!({"q1_rating": "5_etoiles", "final_comments": null});
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&data_exchange("test", answers))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let response = peer.open_response(&body);
    assert_eq!(response["screen"], SUCCESS_SCREEN);
    assert!(response["data"]["confirmation_message"].is_string());

    let (phone, name, source, complete): (String, String, String, bool) = pool
        .get()
        .unwrap()
        .query_row(
            "SELECT phone_number, display_name, identity_source, identity_complete
             FROM survey_submissions WHERE flow_token = 'test'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(phone, "+212600000001");
    assert_eq!(name, "Aicha");
    assert_eq!(source, "queue");
    assert!(complete);

    assert!(eventually(|| !directory.notes().is_empty()).await);
    let notes = directory.notes();
    assert_eq!(notes[0].0, 77);
    assert!(notes[0].1.contains("q1_rating: 5_etoiles"));

    assert!(eventually(|| !relay.sent.lock().unwrap().is_empty()).await);
    assert_eq!(relay.sent.lock().unwrap()[0].0, "+212600000001");
}

#[tokio::test]
async fn unresolved_submission_is_saved_incomplete_without_notifications() {
    let (_dir, pool) = test_pool();
    let relay = Arc::new(FakeRelay::default());
    let app = app(build_state(&pool, true, None, Some(relay.clone())));
    let peer = Peer::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&data_exchange("opaque", json!({"q1": "yes"})))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(peer.open_response(&body)["screen"], SUCCESS_SCREEN);

    let complete: bool = pool
        .get()
        .unwrap()
        .query_row(
            "SELECT identity_complete FROM survey_submissions WHERE flow_token = 'opaque'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(!complete);
    assert!(relay.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn storage_failure_still_returns_success() {
    let (_dir, pool) = test_pool();
    pool.get()
        .unwrap()
        .execute_batch("DROP TABLE survey_submissions;")
        .unwrap();
    let app = app(build_state(&pool, true, None, None));
    let peer = Peer::new();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&data_exchange("deepal-212600000002-abcd", json!({"q1": "no"})))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(peer.open_response(&body)["screen"], SUCCESS_SCREEN);
}

#[tokio::test]
async fn dispatch_rejects_invalid_phone() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow/dispatches",
        Some(json!({"phone_number": "not a phone"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error_of(&body).contains("invalid phone number"));
    assert_eq!(count_rows(&pool, "flow_queue"), 0);
}

#[tokio::test]
async fn token_observation_backfills_incomplete_submission() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));
    let peer = Peer::new();

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/flow",
        Some(peer.envelope(&data_exchange("tok-late", json!({"q1": "ok"})))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow/tokens",
        Some(json!({
            "flow_token": "tok-late",
            "phone_number": "212600000007",
            "display_name": "Omar",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["reconciled"], 1);

    let (phone, source, complete): (String, String, bool) = pool
        .get()
        .unwrap()
        .query_row(
            "SELECT phone_number, identity_source, identity_complete
             FROM survey_submissions WHERE flow_token = 'tok-late'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(phone, "+212600000007");
    assert_eq!(source, "token_mapping");
    assert!(complete);

    // The mapping now serves later submissions carrying the same token.
    assert_eq!(count_rows(&pool, "flow_token_mappings"), 1);
}

#[tokio::test]
async fn token_observation_requires_token() {
    let (_dir, pool) = test_pool();
    let app = app(build_state(&pool, true, None, None));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/flow/tokens",
        Some(json!({"flow_token": "  ", "phone_number": "212600000007"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "flow_token is required");
}
