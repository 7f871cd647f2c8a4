//! HTTP surface: the assembler pull/push endpoints plus job and workorder
//! control.
//!
//! Remote executors see exactly three endpoints: `get-jobs`, `job-results`,
//! `job-error`. Everything else is the operator surface. Domain error codes
//! map onto HTTP statuses here and nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::capability::ParamMap;
use crate::drawing::Drawing;
use crate::error::OrderErrorCode;
use crate::runner::Task;
use crate::scheduler::{Engine, EngineError, JobCounts, JobResultRow, JobStats, WorkOrderRequest};
use crate::store::NewDrawing;
use crate::value::ScriptValue;
use crate::workorder::{ExecutionStyle, WorkOrder};

#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<Engine>,
    /// Tasks handed out per pull when the request omits `max_jobs`.
    pub max_jobs_default: usize,
}

pub fn router(engine: Arc<Engine>, max_jobs_default: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/assembler/get-jobs", post(get_jobs))
        .route("/assembler/job-results", post(job_results))
        .route("/assembler/job-error", post(job_error))
        .route("/drawing", post(create_drawing))
        .route("/drawing/{id}", get(get_drawing))
        .route("/jobs/stats", get(jobs_stats))
        .route("/workorder", post(create_workorder))
        .route("/workorder/{id}", get(get_workorder))
        .route("/workorder/{id}/start", post(start_workorder))
        .route("/workorder/{id}/pause", post(pause_workorder))
        .route("/workorder/{id}/resume", post(resume_workorder))
        .route("/workorder/{id}/abort", post(abort_workorder))
        .route("/workorder/{id}/results", get(workorder_results))
        .route("/job/{id}/pause", post(pause_job))
        .route("/job/{id}/resume", post(resume_job))
        .route("/job/{id}/reset", post(reset_job))
        .route("/job/{id}/rollback", post(rollback_job))
        .route("/job/{id}/clear-dispatched", post(clear_dispatched))
        .route("/job/{id}/signal-complete", post(signal_complete))
        .route("/job/{id}/signal-alert", post(signal_alert))
        .route("/job/{id}/message", post(post_message))
        .route("/job/{id}/stats", get(job_stats))
        .route("/job/{id}/variables", get(job_variables))
        .route("/job/{id}/state", get(job_state))
        .layer(TraceLayer::new_for_http())
        .with_state(GatewayState {
            engine,
            max_jobs_default,
        })
}

pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    max_jobs_default: usize,
) -> AnyResult<()> {
    axum::serve(listener, router(engine, max_jobs_default)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorResponseBody {
    code: String,
    message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    code: String,
    message: String,
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Order(order) => {
                let status = match order.code {
                    OrderErrorCode::JobNotFound
                    | OrderErrorCode::WorkOrderNotFound
                    | OrderErrorCode::DrawingNotFound => StatusCode::NOT_FOUND,
                    OrderErrorCode::QueryNotAllowed
                    | OrderErrorCode::QueryRequired
                    | OrderErrorCode::TooManyParts
                    | OrderErrorCode::ScriptInvalid
                    | OrderErrorCode::InvalidResult => StatusCode::BAD_REQUEST,
                    OrderErrorCode::BadCookie
                    | OrderErrorCode::NotPauseable
                    | OrderErrorCode::NotPaused
                    | OrderErrorCode::NotErrored
                    | OrderErrorCode::NotQueued
                    | OrderErrorCode::RollbackFailed => StatusCode::CONFLICT,
                    OrderErrorCode::BadCheckpoint => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Self {
                    status,
                    code: order.code.as_str().to_string(),
                    message: order.message,
                }
            }
            EngineError::Internal(err) => {
                error!(?err, "request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "INTERNAL".to_string(),
                    message: "internal server error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            code: self.code,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> HttpError {
    HttpError {
        status: StatusCode::BAD_REQUEST,
        code: "BAD_REQUEST".to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Serialize)]
struct AckResponse {
    result: &'static str,
}

const ACCEPTED: AckResponse = AckResponse { result: "Accepted" };

async fn healthz() -> Json<AckResponse> {
    Json(AckResponse { result: "ok" })
}

// ---- Assembler endpoints ----

#[derive(Debug, Deserialize)]
struct GetJobsRequest {
    module_list: Vec<String>,
    max_jobs: Option<usize>,
}

async fn get_jobs(
    State(state): State<GatewayState>,
    Json(request): Json<GetJobsRequest>,
) -> Result<Json<Vec<Task>>, HttpError> {
    let max_jobs = request.max_jobs.unwrap_or(state.max_jobs_default);
    let tasks = state
        .engine
        .process_jobs(&request.module_list, max_jobs)
        .await?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
struct JobResultsRequest {
    job_id: i64,
    cookie: String,
    data: JsonValue,
}

fn to_param_map(data: &JsonValue) -> Result<ParamMap, HttpError> {
    match data {
        JsonValue::Object(entries) => Ok(entries
            .iter()
            .map(|(key, value)| (key.clone(), ScriptValue::from_json(value)))
            .collect()),
        _ => Err(bad_request("data must be an object")),
    }
}

async fn job_results(
    State(state): State<GatewayState>,
    Json(request): Json<JobResultsRequest>,
) -> Result<Json<AckResponse>, HttpError> {
    let data = to_param_map(&request.data)?;
    state
        .engine
        .job_results(request.job_id, &request.cookie, &data)
        .await?;
    Ok(Json(ACCEPTED))
}

#[derive(Debug, Deserialize)]
struct JobErrorRequest {
    job_id: i64,
    cookie: String,
    msg: String,
}

async fn job_error(
    State(state): State<GatewayState>,
    Json(request): Json<JobErrorRequest>,
) -> Result<Json<AckResponse>, HttpError> {
    state
        .engine
        .job_error(request.job_id, &request.cookie, &request.msg)
        .await?;
    Ok(Json(ACCEPTED))
}

// ---- Drawing admission ----

#[derive(Debug, Deserialize)]
struct CreateDrawingRequest {
    name: String,
    #[serde(default)]
    description: String,
    part_query: Option<String>,
    script: String,
}

async fn create_drawing(
    State(state): State<GatewayState>,
    Json(request): Json<CreateDrawingRequest>,
) -> Result<Json<Drawing>, HttpError> {
    let drawing = state
        .engine
        .create_drawing(NewDrawing {
            name: request.name,
            description: request.description,
            part_query: request.part_query,
            script: request.script,
        })
        .await?;
    Ok(Json(drawing))
}

async fn get_drawing(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<Drawing>, HttpError> {
    Ok(Json(state.engine.get_drawing(id).await?))
}

// ---- WorkOrder control ----

#[derive(Debug, Deserialize)]
struct CreateWorkOrderRequest {
    user: String,
    drawing_id: i64,
    execution_style: String,
    part_query: Option<String>,
    #[serde(default)]
    options: JsonValue,
}

async fn create_workorder(
    State(state): State<GatewayState>,
    Json(request): Json<CreateWorkOrderRequest>,
) -> Result<Json<WorkOrder>, HttpError> {
    let execution_style = request
        .execution_style
        .parse::<ExecutionStyle>()
        .map_err(|e| bad_request(e))?;
    let order = state
        .engine
        .create_workorder(WorkOrderRequest {
            user: request.user,
            drawing_id: request.drawing_id,
            execution_style,
            part_query: request.part_query,
            options: request.options,
        })
        .await?;
    Ok(Json(order))
}

async fn get_workorder(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<WorkOrder>, HttpError> {
    Ok(Json(state.engine.get_workorder(id).await?))
}

async fn start_workorder(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<WorkOrder>, HttpError> {
    Ok(Json(state.engine.start_workorder(id).await?))
}

async fn pause_workorder(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.pause_workorder(id).await?;
    Ok(Json(ACCEPTED))
}

async fn resume_workorder(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.resume_workorder(id).await?;
    Ok(Json(ACCEPTED))
}

async fn abort_workorder(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.abort_workorder(id).await?;
    Ok(Json(ACCEPTED))
}

async fn workorder_results(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<JobResultRow>>, HttpError> {
    Ok(Json(state.engine.get_results(id).await?))
}

// ---- Job control ----

async fn pause_job(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.pause_job(id).await?;
    Ok(Json(ACCEPTED))
}

async fn resume_job(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.resume_job(id).await?;
    Ok(Json(ACCEPTED))
}

async fn reset_job(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.reset_job(id).await?;
    Ok(Json(ACCEPTED))
}

async fn rollback_job(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.rollback_job(id).await?;
    Ok(Json(ACCEPTED))
}

async fn clear_dispatched(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.clear_dispatched(id).await?;
    Ok(Json(ACCEPTED))
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    cookie: String,
}

async fn signal_complete(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.signal_complete(id, &request.cookie).await?;
    Ok(Json(ACCEPTED))
}

async fn signal_alert(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(request): Json<PostMessageRequest>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.signal_alert(id, &request.msg).await?;
    Ok(Json(ACCEPTED))
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    msg: String,
}

async fn post_message(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(request): Json<PostMessageRequest>,
) -> Result<Json<AckResponse>, HttpError> {
    state.engine.post_message(id, &request.msg).await?;
    Ok(Json(ACCEPTED))
}

async fn jobs_stats(
    State(state): State<GatewayState>,
) -> Result<Json<JobCounts>, HttpError> {
    Ok(Json(state.engine.job_counts().await?))
}

async fn job_stats(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<JobStats>, HttpError> {
    Ok(Json(state.engine.job_stats(id).await?))
}

async fn job_variables(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<HashMap<String, ScriptValue>>, HttpError> {
    Ok(Json(state.engine.job_runner_variables(id).await?))
}

#[derive(Debug, Serialize)]
struct JobStateResponse {
    state: String,
    runner: String,
}

async fn job_state(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
) -> Result<Json<JobStateResponse>, HttpError> {
    let job = state.engine.job_stats(id).await?;
    let runner = state.engine.job_runner_state(id).await?;
    Ok(Json(JobStateResponse {
        state: job.state.to_string(),
        runner,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::util::ServiceExt;

    use crate::parts::{MemoryPartClient, Part};
    use crate::store::{MemoryStore, NewDrawing, Store};

    async fn test_router() -> (Router, i64) {
        let store = Arc::new(MemoryStore::new());
        let parts = Arc::new(MemoryPartClient::new());
        let mut values = HashMap::new();
        values.insert(
            "hostname".to_string(),
            ScriptValue::Str("mill-04".to_string()),
        );
        parts
            .add_part(Part {
                name: "unit-0".to_string(),
                values,
            })
            .await;
        let drawing = store
            .insert_drawing(NewDrawing {
                name: "burn-in".to_string(),
                description: String::new(),
                part_query: None,
                script: "rc = ssh.exec( host=part.hostname, cmd=\"burn-in\" )".to_string(),
            })
            .await
            .unwrap();
        let engine = Arc::new(Engine::new(store, parts));
        (router(engine, 10), drawing.id)
    }

    async fn request_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => builder
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn assembler_round_trip() {
        let (app, drawing_id) = test_router().await;

        let (status, order) = request_json(
            &app,
            "POST",
            "/workorder",
            Some(json!({
                "user": "inspector",
                "drawing_id": drawing_id,
                "execution_style": "parallel",
                "part_query": "*",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let order_id = order["id"].as_i64().unwrap();

        let uri = format!("/workorder/{}/start", order_id);
        let (status, _) = request_json(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, tasks) = request_json(
            &app,
            "POST",
            "/assembler/get-jobs",
            Some(json!({"module_list": ["ssh"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let tasks = tasks.as_array().unwrap().clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["function"], "ssh.exec");
        assert_eq!(tasks[0]["params"]["host"], "mill-04");

        let (status, body) = request_json(
            &app,
            "POST",
            "/assembler/job-results",
            Some(json!({
                "job_id": tasks[0]["job_id"],
                "cookie": tasks[0]["cookie"],
                "data": {"rc": 0},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "Accepted");

        let (status, counts) = request_json(&app, "GET", "/jobs/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(counts["running"], 1);
    }

    #[tokio::test]
    async fn rejections_carry_domain_codes() {
        let (app, drawing_id) = test_router().await;

        let (status, body) = request_json(
            &app,
            "POST",
            "/workorder",
            Some(json!({
                "user": "inspector",
                "drawing_id": drawing_id,
                "execution_style": "parallel",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "QUERY_REQUIRED");

        let (status, body) = request_json(
            &app,
            "POST",
            "/assembler/job-results",
            Some(json!({"job_id": 404, "cookie": "x", "data": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "JOB_NOT_FOUND");

        let (status, body) = request_json(&app, "POST", "/job/404/pause", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "JOB_NOT_FOUND");

        let (status, body) = request_json(
            &app,
            "POST",
            "/drawing",
            Some(json!({"name": "broken", "script": "goto nowhere"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "SCRIPT_INVALID");
    }
}
