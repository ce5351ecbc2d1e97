//! Agent run lease endpoints

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use skein_core::runs::{AcquireOptions, ActiveRun};
use skein_core::{AgentKey, RunType};

use crate::error::AppError;
use crate::AppState;

/// Build the runs router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(acquire_run))
        // GET takes an agent key, DELETE a run id.
        .route("/:id", get(agent_runs).delete(release_run))
}

/// Request to start a run for an agent
#[derive(Debug, Deserialize)]
pub struct AcquireRunRequest {
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub workspace: Option<String>,
    pub run_type: RunType,
    /// Run types allowed to stay active alongside this one
    #[serde(default)]
    pub allow_concurrent: Vec<RunType>,
    /// Wait up to this long for the agent to become free
    pub wait_ms: Option<u64>,
}

/// Active runs of one agent
#[derive(Debug, Serialize)]
pub struct AgentRunsResponse {
    pub agent_key: AgentKey,
    pub active: bool,
    pub run_types: Vec<RunType>,
    pub runs: Vec<ActiveRun>,
}

/// Acquire a run lease, 409 when the agent is busy
async fn acquire_run(
    State(state): State<AppState>,
    Json(req): Json<AcquireRunRequest>,
) -> Result<(StatusCode, Json<ActiveRun>), AppError> {
    let has_explicit = req
        .agent_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    let name = req.agent_name.as_deref().unwrap_or_default();
    if !has_explicit && name.trim().is_empty() {
        return Err(AppError::BadRequest(
            "agent_id or agent_name is required".to_string(),
        ));
    }
    let agent_key = AgentKey::resolve(
        req.agent_id.as_deref(),
        name,
        req.workspace.as_deref().unwrap_or_default(),
    );

    let lease = match req.wait_ms.filter(|ms| *ms > 0) {
        Some(wait_ms) => {
            let runs = &state.config.runs;
            let options = AcquireOptions {
                allowed_active: req.allow_concurrent.clone(),
                timeout: Duration::from_millis(wait_ms).min(runs.acquire_timeout()),
                poll_interval: runs.acquire_poll_interval(),
            };
            state
                .coordinator
                .acquire_with_timeout(&agent_key, req.run_type, &options)
                .await
        }
        None => state
            .coordinator
            .try_acquire(&agent_key, req.run_type, &req.allow_concurrent),
    };

    let Some(lease) = lease else {
        return Err(AppError::Conflict(format!(
            "Agent {} is busy ({})",
            agent_key,
            state
                .coordinator
                .active_run_types(&agent_key)
                .iter()
                .map(RunType::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )));
    };

    let run = lease.descriptor().clone();
    tracing::info!(
        agent_key = %run.agent_key,
        run_id = %run.run_id,
        run_type = %run.run_type,
        "Run lease acquired"
    );
    state
        .run_leases
        .write()
        .await
        .insert(run.run_id.clone(), lease);
    Ok((StatusCode::CREATED, Json(run)))
}

/// Release a run lease by run id
async fn release_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let lease = state
        .run_leases
        .write()
        .await
        .remove(&run_id)
        .ok_or_else(|| AppError::NotFound(format!("Run not found: {}", run_id)))?;

    if !lease.release() {
        // Already reclaimed by the stale-lease reaper.
        tracing::debug!(run_id = %run_id, "Run lease was already released");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// List active runs for an agent key
async fn agent_runs(
    State(state): State<AppState>,
    Path(agent_key): Path<String>,
) -> Json<AgentRunsResponse> {
    let agent_key = AgentKey::from(agent_key);
    let runs = state.coordinator.active_runs(&agent_key);
    Json(AgentRunsResponse {
        active: !runs.is_empty(),
        run_types: state.coordinator.active_run_types(&agent_key),
        agent_key,
        runs,
    })
}
