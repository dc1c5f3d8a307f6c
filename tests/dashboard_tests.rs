use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use jobstore_lite::dashboard::router;
use jobstore_lite::models::{
    Execution, ExecutionId, ExecutionPatch, ExecutionStateType, JobStateType,
};
use jobstore_lite::store::{
    InMemoryJobStore, JobStore, UpdateExecutionRequest, UpdateJobStateRequest,
};

fn create_test_app() -> (Router, Arc<dyn JobStore>) {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    (router(store.clone()), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_job(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn submit(app: &Router, id: &str, client: &str, tags: &[&str]) {
    let (status, _) = send(
        app,
        post_job(json!({
            "id": id,
            "client_id": client,
            "spec": {"engine": "docker", "annotations": tags},
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_submit_job_returns_created() {
    let (app, _store) = create_test_app();

    let (status, body) = send(
        &app,
        post_job(json!({
            "client_id": "client-a",
            "spec": {"engine": "docker", "entrypoint": ["echo", "hi"], "timeout_secs": 60},
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["client_id"], "client-a");
    assert_eq!(body["spec"]["concurrency"], 1);
    let id = body["id"].as_str().unwrap();
    assert!(!id.is_empty());

    let (status, body) = send(&app, get(&format!("/api/jobs/{id}/state"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "new");
    assert_eq!(body["version"], 1);
    assert!(body["timeout_at"].is_string());
}

#[tokio::test]
async fn test_duplicate_job_conflicts() {
    let (app, _store) = create_test_app();
    submit(&app, "job-1", "client", &[]).await;

    let (status, body) = send(
        &app,
        post_job(json!({"id": "job-1", "client_id": "client", "spec": {"engine": "docker"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "already_exists");
}

#[tokio::test]
async fn test_missing_job_is_not_found() {
    let (app, _store) = create_test_app();

    for uri in [
        "/api/jobs/nope",
        "/api/jobs/nope/state",
        "/api/jobs/nope/history",
    ] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["kind"], "not_found");
    }
}

#[tokio::test]
async fn test_list_jobs_filters_and_counts() {
    let (app, _store) = create_test_app();
    submit(&app, "job-1", "alice", &["gpu"]).await;
    submit(&app, "job-2", "alice", &["cpu"]).await;
    submit(&app, "job-3", "bob", &["gpu"]).await;

    let (status, body) = send(&app, get("/api/jobs?client_id=alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let (_, body) = send(&app, get("/api/jobs?all=true&include_tags=gpu")).await;
    let ids: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["job-1", "job-3"]);

    let (_, body) = send(
        &app,
        get("/api/jobs?all=true&sort_by=id&reverse=true&limit=2"),
    )
    .await;
    let ids: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["job-3", "job-2"]);
    assert_eq!(body["total_count"], 3);
}

#[tokio::test]
async fn test_list_jobs_rejects_unknown_sort() {
    let (app, _store) = create_test_app();
    let (status, body) = send(&app, get("/api/jobs?sort_by=name")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

#[tokio::test]
async fn test_history_filters_levels() {
    let (app, store) = create_test_app();
    submit(&app, "job-1", "client", &[]).await;

    store
        .update_job_state(UpdateJobStateRequest::new("job-1", JobStateType::InProgress))
        .await
        .unwrap();
    let exec_id = ExecutionId::new("job-1", "node-1", "exec-1");
    store
        .create_execution(Execution::new(exec_id.clone()))
        .await
        .unwrap();
    store
        .update_execution(UpdateExecutionRequest::new(
            exec_id,
            ExecutionPatch::state(ExecutionStateType::AskForBid),
        ))
        .await
        .unwrap();

    let (status, body) = send(&app, get("/api/jobs/job-1/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);

    let (_, body) = send(&app, get("/api/jobs/job-1/history?exclude_execution_level=true")).await;
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["history_type"] == "job_level"));

    let (_, body) = send(&app, get("/api/jobs/job-1/history?exclude_job_level=true")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_in_progress_lists_active_jobs() {
    let (app, store) = create_test_app();
    submit(&app, "job-1", "client", &[]).await;
    submit(&app, "job-2", "client", &[]).await;

    store
        .update_job_state(UpdateJobStateRequest::new("job-2", JobStateType::InProgress))
        .await
        .unwrap();

    let (status, body) = send(&app, get("/api/in-progress")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["job"]["id"], "job-2");
    assert_eq!(jobs[0]["state"]["state"], "in_progress");
}

#[tokio::test]
async fn test_short_ids_resolve_or_report_ambiguity() {
    let (app, _store) = create_test_app();
    submit(&app, "abcdefgh-0001", "client", &[]).await;
    submit(&app, "abcdefgh-0002", "client", &[]).await;
    submit(&app, "12345678-0001", "client", &[]).await;

    let (status, body) = send(&app, get("/api/jobs/12345678")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "12345678-0001");

    let (status, body) = send(&app, get("/api/jobs/abcdefgh")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "ambiguous");
}
