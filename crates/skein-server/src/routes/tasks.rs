//! Task scheduler endpoints

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use skein_core::scheduler::{RepairReport, TaskFilter};
use skein_core::{EnqueueTaskInput, Task, TaskKind, TaskStatus};

use crate::error::AppError;
use crate::AppState;

/// Prefix of list query parameters that filter on task context
const CONTEXT_PARAM_PREFIX: &str = "ctx.";

/// Build the tasks router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(enqueue_task))
        .route("/repair", post(repair_tasks))
        .route("/:id", get(get_task))
        .route("/:id/cancel", post(cancel_task))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RepairRequest {
    /// Defaults to the configured `stale_after_ms`
    pub max_age_ms: Option<u64>,
}

async fn enqueue_task(
    State(state): State<AppState>,
    Json(input): Json<EnqueueTaskInput>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state.scheduler.enqueue(input).await?;
    tracing::info!(task_id = %task.id, kind = task.kind.as_str(), "Task enqueued");
    Ok((StatusCode::CREATED, Json(task)))
}

/// List tasks. Supports `status` (comma separated), `kind`, `key`, `limit`
/// and `ctx.<name>=<value>` filters.
async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Task>>, AppError> {
    let filter = parse_filter(&params)?;
    let tasks = state.scheduler.list(&filter).await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    state
        .scheduler
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Task not found: {}", id)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Task>, AppError> {
    let reason = body.and_then(|Json(req)| req.reason);
    let task = state
        .scheduler
        .cancel(&id, reason.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Task not found: {}", id)))?;
    Ok(Json(task))
}

async fn repair_tasks(
    State(state): State<AppState>,
    body: Option<Json<RepairRequest>>,
) -> Result<Json<RepairReport>, AppError> {
    let max_age = body
        .and_then(|Json(req)| req.max_age_ms)
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.scheduler.stale_after());

    let report = state.scheduler.repair_stale_running_tasks(max_age).await?;
    if !report.is_empty() {
        tracing::info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Repaired stale tasks"
        );
    }
    Ok(Json(report))
}

fn parse_filter(params: &HashMap<String, String>) -> Result<TaskFilter, AppError> {
    let mut filter = TaskFilter::default();

    for (name, value) in params {
        match name.as_str() {
            "status" => {
                for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let status = TaskStatus::parse(raw)
                        .ok_or_else(|| AppError::BadRequest(format!("Unknown status: {}", raw)))?;
                    if !filter.statuses.contains(&status) {
                        filter.statuses.push(status);
                    }
                }
            }
            "kind" => {
                let kind = TaskKind::parse(value)
                    .ok_or_else(|| AppError::BadRequest(format!("Unknown kind: {}", value)))?;
                filter.kind = Some(kind);
            }
            "key" => {
                let key = value.trim();
                if !key.is_empty() {
                    filter.key = Some(key.to_string());
                }
            }
            "limit" => {
                let limit = value
                    .parse::<usize>()
                    .map_err(|_| AppError::BadRequest(format!("Invalid limit: {}", value)))?;
                filter.limit = Some(limit);
            }
            other => {
                if let Some(ctx_name) = other.strip_prefix(CONTEXT_PARAM_PREFIX) {
                    if !ctx_name.is_empty() {
                        filter.context.insert(ctx_name.to_string(), value.clone());
                    }
                }
            }
        }
    }

    Ok(filter)
}
