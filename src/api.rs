//! HTTP control surface (spec §4.G / §6): a thin JSON router translating
//! wire calls into Job Store / Placement / Supervisor operations. Handlers
//! only acquire the scheduler lock and serialize the result — they never
//! block on the poller, which runs on the control loop's own tick.

use crate::core::job::Job;
use crate::core::scheduler::Shared;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::Arc;

/// A `Json<T>` extractor that maps every rejection (missing body, wrong
/// content type, or a body that fails to deserialize into `T` — including a
/// negative number landing on an unsigned field) to 400, per spec §6/§7:
/// "400 on malformed body" / "non-positive `num_gpus`, malformed `gpu_ids`".
/// Plain `axum::Json` instead answers these with 415/422, which the spec
/// doesn't distinguish from any other malformed submission.
struct ValidatedJson<T>(T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = axum::response::Response;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": rejection.to_string() })),
            )
                .into_response()),
        }
    }
}

/// Wakes the control loop immediately after a submission or cancellation so
/// a job doesn't sit idle for a full `poll_interval` before its first
/// chance at placement (mirrors the teacher's `SchedulerNotify` in
/// `src/bin/gflowd/server.rs`).
pub type WakeUp = tokio::sync::mpsc::Sender<()>;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Shared,
    pub wake_up: WakeUp,
    pub output_root: Arc<PathBuf>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/gpus", get(list_gpus))
        .with_state(state)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Folds `recent_output` into the job's serialized fields, per spec §6:
/// "Job response fields are the Job record of §3 serialized verbatim;
/// additionally `recent_output` ... may be present in the single-job
/// endpoint." Falls back to the bare job value if serialization somehow
/// produces a non-object (never happens for `Job`, guarded defensively).
fn job_with_recent_output(job: &Job, recent_output: Option<String>) -> serde_json::Value {
    let mut value = serde_json::to_value(job).unwrap_or(serde_json::Value::Null);
    if let (Some(obj), Some(tail)) = (value.as_object_mut(), recent_output) {
        obj.insert("recent_output".to_string(), serde_json::Value::String(tail));
    }
    value
}

async fn create_job(
    State(state): State<ApiState>,
    ValidatedJson(config): ValidatedJson<crate::core::job::JobConfig>,
) -> impl IntoResponse {
    let mut guard = state.scheduler.write().await;
    match guard.submit(config, now()) {
        Ok(job_id) => {
            drop(guard);
            let _ = state.wake_up.try_send(());
            (
                StatusCode::OK,
                Json(serde_json::json!({ "job_id": job_id })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    let guard = state.scheduler.read().await;
    let jobs = guard.store.list();
    (StatusCode::OK, Json(serde_json::json!({ "jobs": jobs }))).into_response()
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let guard = state.scheduler.read().await;
    match guard.store.get(&id) {
        Some(job) => {
            let job = job.clone();
            let recent_output = guard.recent_output(&state.output_root, &id);
            let body = job_with_recent_output(&job, recent_output);
            (StatusCode::OK, Json(serde_json::json!({ "job": body }))).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let mut guard = state.scheduler.write().await;
    if guard.store.get(&id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let cancelled = guard.cancel(&id, now());
    drop(guard);
    if cancelled {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        )
            .into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "job is not cancelable" })),
        )
            .into_response()
    }
}

async fn list_gpus(State(state): State<ApiState>) -> impl IntoResponse {
    let guard = state.scheduler.read().await;
    let gpus = guard.gpus.list();
    (StatusCode::OK, Json(serde_json::json!({ "gpus": gpus }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::SchedulerState;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_state(output_root: PathBuf) -> (ApiState, tokio::sync::mpsc::Receiver<()>) {
        let state = SchedulerState::new(output_root.clone(), "/bin/true".into(), 0, 100);
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (
            ApiState {
                scheduler: Arc::new(tokio::sync::RwLock::new(state)),
                wake_up: tx,
                output_root: Arc::new(output_root),
            },
            rx,
        )
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submitting_a_malformed_job_returns_400() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command": ""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submitting_a_body_missing_command_returns_400_not_422() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"num_gpus": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submitting_a_negative_num_gpus_returns_400_not_422() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command": "true", "num_gpus": -1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submitting_a_valid_job_returns_job_id_and_wakes_the_loop() {
        let dir = tempdir().unwrap();
        let (state, mut rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command": "true", "num_gpus": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["job_id"], "job1");
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn get_unknown_job_is_404() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(Request::get("/jobs/job999").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_queued_job_then_second_cancel_is_not_cancelable() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .clone()
            .oneshot(
                Request::post("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"command": "true"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(resp).await;
        let job_id = json["job_id"].as_str().unwrap().to_string();

        let resp = router
            .clone()
            .oneshot(
                Request::post(format!("/jobs/{job_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["success"], true);

        let resp = router
            .oneshot(
                Request::post(format!("/jobs/{job_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_gpus_is_empty_before_first_poll() {
        let dir = tempdir().unwrap();
        let (state, _rx) = test_state(dir.path().to_path_buf());
        let router = build_router(state);

        let resp = router
            .oneshot(Request::get("/gpus").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["gpus"].as_array().unwrap().len(), 0);
    }
}
