//! REST routes over [`KgService`].

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use super::ApiError;
use super::sse::build_sse_response;
use crate::kg::domain::{GraphTarget, KgEvent, Stage, TaskRecord};
use crate::kg::persistence::schema::GraphTables;
use crate::kg::service::KgService;
use crate::kg::submit::SubmitParams;

/// Routes mounted under `/api/kg`.
pub fn build_router() -> Router<KgService> {
    Router::new()
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", axum::routing::delete(remove_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/retry", post(retry_task))
        .route("/build-tasks", get(list_build_tasks))
        .route("/concurrency", put(update_concurrency).get(get_concurrency))
        .route("/schema", post(create_schema))
        .route("/housekeeping", post(housekeeping))
        .route("/events", get(stream_events))
}

// =============================================================================
// DTOs
// =============================================================================

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task: Option<TaskRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConcurrencyBody {
    pub concurrency: usize,
}

#[derive(Debug, Serialize)]
struct TouchedTask {
    stage: Stage,
    task: TaskRecord,
}

#[derive(Debug, Serialize)]
struct SchemaResponse {
    target: GraphTarget,
    tables: GraphTables,
}

// =============================================================================
// Handlers
// =============================================================================

async fn submit_task(
    State(service): State<KgService>,
    Json(params): Json<SubmitParams>,
) -> Result<impl IntoResponse, ApiError> {
    let task = service.submit_task(&params).await?;
    let status = if task.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(SubmitResponse { task })))
}

async fn list_tasks(State(service): State<KgService>) -> Result<Json<Vec<TaskRecord>>, ApiError> {
    Ok(Json(service.query_status().await?))
}

async fn list_build_tasks(
    State(service): State<KgService>,
) -> Result<Json<Vec<TaskRecord>>, ApiError> {
    Ok(Json(service.query_build_status().await?))
}

async fn cancel_task(
    State(service): State<KgService>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TouchedTask>>, ApiError> {
    let touched = service.cancel_task(&id).await?;
    Ok(Json(to_touched(touched)))
}

async fn retry_task(
    State(service): State<KgService>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TouchedTask>>, ApiError> {
    let touched = service.retry_task(&id).await?;
    Ok(Json(to_touched(touched)))
}

fn to_touched(touched: Vec<(Stage, TaskRecord)>) -> Vec<TouchedTask> {
    touched
        .into_iter()
        .map(|(stage, task)| TouchedTask { stage, task })
        .collect()
}

async fn remove_task(
    State(service): State<KgService>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.remove_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_concurrency(State(service): State<KgService>) -> Json<ConcurrencyBody> {
    Json(ConcurrencyBody {
        concurrency: service.concurrency(),
    })
}

async fn update_concurrency(
    State(service): State<KgService>,
    Json(body): Json<ConcurrencyBody>,
) -> Result<Json<ConcurrencyBody>, ApiError> {
    service.update_concurrency(body.concurrency)?;
    Ok(Json(body))
}

async fn create_schema(
    State(service): State<KgService>,
    Json(target): Json<GraphTarget>,
) -> Result<(StatusCode, Json<SchemaResponse>), ApiError> {
    let tables = service.create_graph_schema(&target).await?;
    Ok((StatusCode::CREATED, Json(SchemaResponse { target, tables })))
}

async fn housekeeping(
    State(service): State<KgService>,
) -> Result<impl IntoResponse, ApiError> {
    let report = service.housekeeping().await?;
    Ok(Json(json!({ "report": report })))
}

async fn stream_events(State(service): State<KgService>) -> impl IntoResponse {
    // Lagged receivers skip what they missed.
    let stream = BroadcastStream::new(service.subscribe())
        .filter_map(|res: Result<KgEvent, _>| res.ok());
    build_sse_response(stream)
}
