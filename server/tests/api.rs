//! HTTP contract tests

mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use server::session::SessionState;
use tower::ServiceExt;
use uuid::Uuid;

use common::*;

async fn get(router: &Router, uri: &str) -> Response {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(router: &Router, uri: &str, body: Value) -> Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn start_body() -> Value {
    json!({
        "url_images": ["data:image/png;base64,AAAA"],
        "question": "Who painted this?"
    })
}

async fn start(router: &Router) -> Uuid {
    let response = post_json(router, "/start-processing", start_body()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["data"], "success");
    json["task_id"].as_str().unwrap().parse().unwrap()
}

fn default_app() -> common::TestApp {
    create_test_app(
        FakeNarrator::new(&["It is", " a fresco.", " Painted wet."]),
        Arc::new(FakeSynthesizer::new()),
        tagging_factory(),
    )
}

#[tokio::test]
async fn test_health_check() {
    let app = default_app();
    for uri in ["/health", "/healthz", "/api/health"] {
        let response = get(&app.router, uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body_bytes(response).await, b"ok");
    }
}

#[tokio::test]
async fn test_start_then_stream() {
    let app = default_app();
    let id = start(&app.router).await;

    let response = get(&app.router, &format!("/audio-stream/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "audio/mpeg"
    );
    let body = body_bytes(response).await;
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "[It is a fresco.]|[Painted wet.]|"
    );
}

#[tokio::test]
async fn test_second_attach_gets_empty_body() {
    let app = default_app();
    let id = start(&app.router).await;

    let first = get(&app.router, &format!("/audio-stream/{id}")).await;
    assert!(!body_bytes(first).await.is_empty());

    let second = get(&app.router, &format!("/api/audio-stream/{id}")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert!(body_bytes(second).await.is_empty());
    assert_eq!(
        app.metrics()
            .duplicate_attaches
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_stream_with_offset() {
    let app = default_app();
    let id = start(&app.router).await;
    wait_until_settled(app.registry(), &id).await;

    let response = get(&app.router, &format!("/audio-stream/{id}?offset=18")).await;
    let body = body_bytes(response).await;
    assert_eq!(String::from_utf8(body).unwrap(), "[Painted wet.]|");
}

#[tokio::test]
async fn test_out_of_range_offset_keeps_session_unconsumed() {
    let app = default_app();
    let id = start(&app.router).await;
    wait_until_settled(app.registry(), &id).await;

    let response = get(
        &app.router,
        &format!("/audio-stream/{id}?offset={}", u64::MAX),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 400);
    assert!(!app.registry().get(&id).unwrap().snapshot().consumed);

    let response = get(&app.router, &format!("/audio-stream/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        String::from_utf8(body_bytes(response).await).unwrap(),
        "[It is a fresco.]|[Painted wet.]|"
    );
}

#[tokio::test]
async fn test_failed_session_streams_nothing() {
    let app = create_test_app(
        FakeNarrator::breaking(&["Never finished"]),
        Arc::new(FakeSynthesizer::new()),
        tagging_factory(),
    );
    let id = start(&app.router).await;
    let session = wait_until_settled(app.registry(), &id).await;
    assert_eq!(session.state(), SessionState::Failed);

    let response = get(&app.router, &format!("/audio-stream/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_unknown_and_invalid_ids() {
    let app = default_app();

    let response = get(&app.router, &format!("/audio-stream/{}", Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], 404);

    let response = get(&app.router, "/audio-stream/speech-42").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&app.router, "/sessions/not-a-uuid").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_processing_validation() {
    let app = default_app();

    let response = post_json(
        &app.router,
        "/start-processing",
        json!({ "url_images": ["data:image/png;base64,AAAA"], "question": "  " }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], 400);
    assert!(json["error"].as_str().unwrap().contains("empty"));

    let response = post_json(
        &app.router,
        "/api/start-processing",
        json!({ "url_images": [], "question": "Who?" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(app.registry().is_empty());
}

#[tokio::test]
async fn test_session_status() {
    let synth = Arc::new(FakeSynthesizer::new().fail_on("wet"));
    let app = create_test_app(
        FakeNarrator::new(&["It is", " a fresco.", " Painted wet."]),
        synth,
        tagging_factory(),
    );
    let id = start(&app.router).await;
    wait_until_settled(app.registry(), &id).await;

    let response = get(&app.router, &format!("/sessions/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["id"], id.to_string());
    assert_eq!(json["state"], "complete");
    assert_eq!(json["consumed"], false);
    assert_eq!(json["sentences"], 2);
    assert_eq!(json["gaps"], json!([1]));
    assert_eq!(json["bytes_written"], "[It is a fresco.]|".len());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = default_app();
    let id = start(&app.router).await;
    wait_until_settled(app.registry(), &id).await;

    let response = get(&app.router, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["pipeline"]["sessions_started"], 1);
    assert_eq!(json["pipeline"]["sessions_completed"], 1);
    assert_eq!(json["pipeline"]["sentences"], 2);
    assert_eq!(json["synthesis"]["count"], 2);
    assert!(json["system"]["request_count"].as_u64().unwrap() >= 1);
}
