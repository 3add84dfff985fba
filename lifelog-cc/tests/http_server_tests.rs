//! HTTP Server & Routing Integration Tests

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use helpers::{day, TestCrew};
use lifelog_cc::services::SchedulerHandle;
use lifelog_cc::{build_router, AppState};

fn test_app(t: &TestCrew) -> Router {
    let state = AppState::new(
        t.pool.clone(),
        t.event_bus.clone(),
        t.crew.clone(),
        SchedulerHandle::default(),
    );
    build_router(state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn post(app: Router, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn health_reports_module_and_counts() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 1)).await;

    let (status, body) = get(test_app(&t), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "lifelog-cc");
    assert_eq!(body["in_flight"], 0);
    assert_eq!(body["records_by_status"]["pending"], 1);
}

#[tokio::test]
async fn conversation_endpoint_serves_projection() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 2)).await;

    let (status, body) = get(test_app(&t), "/days/2024-09-02/conversation").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["deduplicated"], true);
    assert_eq!(body["cacheHit"], false);

    let lines = body["projection"]["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "canonical");
    assert_eq!(lines[0]["hiddenVariations"], 1);
    assert!(lines[0]["clusterId"].is_string());
    assert_eq!(lines[1]["kind"], "unique");

    let (_, again) = get(test_app(&t), "/days/2024-09-02/conversation").await;
    assert_eq!(again["cacheHit"], true);
}

#[tokio::test]
async fn conversation_endpoint_rejects_bad_day() {
    let t = TestCrew::new().await;
    let (status, body) = get(test_app(&t), "/days/not-a-day/conversation").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn unknown_day_is_404() {
    let t = TestCrew::new().await;
    let (status, body) = get(test_app(&t), "/days/2031-01-01/conversation").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = get(test_app(&t), "/days/2031-01-01/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn no_wait_query_returns_processing() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 3)).await;
    t.provider.set_delay(std::time::Duration::from_millis(300));

    let (status, body) = get(test_app(&t), "/days/2024-09-03/conversation?wait=false").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");
    assert!(body["estimatedRemainingMs"].is_u64());
}

#[tokio::test]
async fn status_endpoint_reports_day_state() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 4)).await;

    let (status, body) = get(test_app(&t), "/days/2024-09-04/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["priority"], "low");
    assert_eq!(body["recordCount"], 1);
}

#[tokio::test]
async fn enqueue_endpoint_accepts_priority() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 5)).await;

    let (status, body) = post(
        test_app(&t),
        "/days/2024-09-05/enqueue",
        Some(json!({ "priority": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["priority"], "high");

    let (status, _) = post(
        test_app(&t),
        "/days/2024-09-05/enqueue",
        Some(json!({ "priority": "whenever" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn enqueue_without_body_uses_normal_priority() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 6)).await;

    let (status, body) = post(test_app(&t), "/days/2024-09-06/enqueue", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["priority"], "normal");
}

#[tokio::test]
async fn scheduler_trigger_is_accepted() {
    let t = TestCrew::new().await;
    let (status, body) = post(test_app(&t), "/scheduler/run", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "triggered");
}

#[tokio::test]
async fn progress_stream_is_event_stream() {
    let t = TestCrew::new().await;
    t.seed_heat_day(day(2024, 9, 7)).await;

    let response = test_app(&t)
        .oneshot(
            Request::builder()
                .uri("/days/2024-09-07/progress")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/event-stream"));

    let (status, _) = get(test_app(&t), "/days/2031-02-02/progress").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
