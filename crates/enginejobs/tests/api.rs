mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{age_lock, setup_db};
use enginejobs::api::{router, ApiState};
use enginejobs::jobs::{JobsRepo, MetricsRepo, RunsRepo};
use serde_json::{json, Value};
use serial_test::serial;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tower::ServiceExt;

fn app(pool: PgPool) -> Router {
    router(ApiState {
        jobs: JobsRepo::new(pool.clone()),
        runs: RunsRepo::new(pool.clone()),
        metrics: MetricsRepo::new(pool),
    })
}

/// Router over a pool that never connects, for routes that answer before
/// touching the database.
fn offline_app() -> Router {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://nobody@127.0.0.1:1/none")
        .unwrap();
    app(pool)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let req = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => req
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_is_ok() {
    let app = offline_app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn invalid_enqueue_is_bad_request() {
    let app = offline_app();
    let (status, _) = send(
        &app,
        "POST",
        "/jobs",
        Some(json!({"workspace_id": "", "job_type": "alert.check"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_status_filter_is_bad_request() {
    let app = offline_app();
    let (status, _) = send(&app, "GET", "/jobs?status=exploded", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn negative_stale_minutes_is_bad_request() {
    let app = offline_app();
    let (status, _) = send(
        &app,
        "POST",
        "/maintenance/requeue-stale",
        Some(json!({"stale_minutes": -1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[serial]
async fn enqueue_then_inspect_over_http() {
    let Some(pool) = setup_db().await else { return };
    let app = app(pool.clone());

    let body = json!({
        "workspace_id": "ws-1",
        "job_type": "alert.check",
        "payload": {"alert_id": 11},
        "dedupe_key": "alert-11"
    });

    let (status, first) = send_json(&app, "POST", "/jobs", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["enqueued"], json!(true));
    let id = first["job_id"].as_i64().unwrap();

    let (_, dup) = send_json(&app, "POST", "/jobs", Some(body)).await;
    assert_eq!(dup["enqueued"], json!(false));
    assert_eq!(dup["job_id"], Value::Null);

    let (status, job) = send_json(&app, "GET", &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], json!("pending"));
    assert_eq!(job["payload"], json!({"alert_id": 11}));

    let (status, list) = send_json(&app, "GET", "/jobs?workspace_id=ws-1&status=pending", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, "GET", "/jobs/424242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // live jobs cannot be replayed
    let (status, _) = send(&app, "POST", &format!("/jobs/{id}/replay"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, metrics) = send_json(&app, "GET", "/metrics?workspace_id=ws-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["pending"], json!(1));
}

#[tokio::test]
#[serial]
async fn dead_letter_and_replay_over_http() {
    let Some(pool) = setup_db().await else { return };
    let app = app(pool.clone());
    let repo = JobsRepo::new(pool.clone());

    let (_, res) = send_json(
        &app,
        "POST",
        "/jobs",
        Some(json!({"workspace_id": "ws-1", "job_type": "signal.label", "max_attempts": 1})),
    )
    .await;
    let id = res["job_id"].as_i64().unwrap();

    let job = repo.claim_next("worker-a", None).await.unwrap().unwrap();
    repo.fail(id, "worker-a", job.lock_token, "boom", None)
        .await
        .unwrap();

    let (_, dead) = send_json(&app, "GET", "/dead", None).await;
    let items = dead["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], json!(id));

    let (_, runs) = send_json(&app, "GET", &format!("/jobs/{id}/runs"), None).await;
    assert_eq!(runs["runs"][0]["success"], json!(false));
    assert_eq!(runs["runs"][0]["error"], json!("boom"));

    let (status, replay) = send_json(&app, "POST", &format!("/jobs/{id}/replay"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["enqueued"], json!(true));
    assert_eq!(replay["replay_of_job_id"], json!(id));
}

#[tokio::test]
#[serial]
async fn requeue_stale_over_http() {
    let Some(pool) = setup_db().await else { return };
    let app = app(pool.clone());
    let repo = JobsRepo::new(pool.clone());

    let id = repo
        .enqueue_now("ws-1", "alert.check", json!({}))
        .await
        .unwrap()
        .job_id
        .unwrap();
    repo.claim_next("worker-a", None).await.unwrap().unwrap();
    age_lock(&pool, id, 30).await;

    let (status, res) = send_json(
        &app,
        "POST",
        "/maintenance/requeue-stale",
        Some(json!({"stale_minutes": 15})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(res["requeued"], json!(1));
}
