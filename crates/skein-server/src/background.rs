//! Background loops owned by the server: the task worker and the stale run
//! lease reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skein_core::scheduler::{
    AgentRunHandler, HookedTurn, RecurringJob, RecurringPlanner, TaskWorker, WorkerOptions,
};
use skein_core::KernelConfig;

use crate::AppState;

/// Running background loops. Dropping this does not stop them; call
/// [`Background::shutdown`].
pub struct Background {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    /// Signal every loop to stop and wait for them
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Background task ended abnormally: {}", e);
            }
        }
    }
}

/// Recurring heartbeat jobs from `[[heartbeats]]` config entries
pub fn heartbeat_planner(config: &KernelConfig) -> RecurringPlanner {
    let mut planner = RecurringPlanner::new();
    for hb in &config.heartbeats {
        if let Err(e) = planner.add(RecurringJob::heartbeat(&hb.agent_key, hb.every())) {
            tracing::warn!(agent_key = %hb.agent_key, "Skipping heartbeat: {}", e);
        }
    }
    planner
}

/// Build the task worker that runs agent tasks under the run coordinator
pub fn task_worker(state: &AppState) -> TaskWorker {
    let handler = AgentRunHandler::new(
        state.coordinator.clone(),
        Arc::new(HookedTurn::new(state.hooks.clone())),
    );
    TaskWorker::new(
        Arc::clone(&state.scheduler),
        Arc::new(handler),
        Arc::clone(&state.task_events),
        WorkerOptions::from(&state.config.scheduler),
    )
    .with_planner(heartbeat_planner(&state.config))
}

/// Force-release run leases older than the configured max age and forget
/// their HTTP handles. Returns how many runs were reclaimed.
pub async fn reap_stale_runs(state: &AppState, max_age: Duration) -> usize {
    let reclaimed = state.coordinator.release_stale(max_age, Utc::now());
    if reclaimed.is_empty() {
        return 0;
    }

    let mut leases = state.run_leases.write().await;
    for run in &reclaimed {
        tracing::warn!(
            agent_key = %run.agent_key,
            run_id = %run.run_id,
            run_type = %run.run_type,
            "Released stale run lease"
        );
        leases.remove(&run.run_id);
    }
    reclaimed.len()
}

/// Spawn the worker and reaper loops
pub fn spawn(state: &AppState) -> Background {
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    let worker = task_worker(state);
    let token = shutdown.clone();
    handles.push(tokio::spawn(async move { worker.run(token).await }));

    let reaper_state = state.clone();
    let token = shutdown.clone();
    handles.push(tokio::spawn(async move {
        let max_age = reaper_state.config.runs.lease_max_age();
        let mut interval = tokio::time::interval(reaper_state.config.scheduler.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    reap_stale_runs(&reaper_state, max_age).await;
                }
            }
        }
    }));

    tracing::info!(
        heartbeats = state.config.heartbeats.len(),
        "Background task worker started"
    );
    Background { shutdown, handles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::scheduler::MemoryTaskStore;
    use skein_core::{AgentKey, HeartbeatConfig, RunType};
    use std::collections::HashMap;

    fn state(config: KernelConfig) -> AppState {
        AppState::new(config, Arc::new(MemoryTaskStore::new()), &HashMap::new())
    }

    #[test]
    fn planner_has_one_job_per_heartbeat() {
        let config = KernelConfig {
            heartbeats: vec![
                HeartbeatConfig {
                    agent_key: "agent-1".to_string(),
                    every_ms: 60_000,
                },
                HeartbeatConfig {
                    agent_key: "agent-2".to_string(),
                    every_ms: 5_000,
                },
            ],
            ..KernelConfig::default()
        };
        let planner = heartbeat_planner(&config);
        assert_eq!(planner.jobs().len(), 2);
        assert_eq!(planner.jobs()[0].key, "heartbeat:agent-1");
    }

    #[tokio::test]
    async fn reaper_forgets_reclaimed_leases() {
        let state = state(KernelConfig::default());
        let key = AgentKey::from("agent-1");
        let lease = state
            .coordinator
            .try_acquire(&key, RunType::User, &[])
            .expect("free agent");
        let run_id = lease.run_id().to_string();
        state.run_leases.write().await.insert(run_id.clone(), lease);

        assert_eq!(reap_stale_runs(&state, Duration::from_secs(3600)).await, 0);
        assert!(state.run_leases.read().await.contains_key(&run_id));

        assert_eq!(reap_stale_runs(&state, Duration::ZERO).await, 1);
        assert!(!state.run_leases.read().await.contains_key(&run_id));
        assert!(!state.coordinator.is_active(&key));
    }

    #[tokio::test]
    async fn worker_tick_runs_agent_task_and_publishes_on_run_channel() {
        let state = state(KernelConfig::default());
        let task = state
            .scheduler
            .enqueue(
                skein_core::EnqueueTaskInput::adhoc()
                    .with_payload("agent_key", serde_json::json!("agent-9"))
                    .with_payload("prompt", serde_json::json!("wake up")),
            )
            .await
            .expect("enqueue");

        let report = task_worker(&state).tick(Utc::now()).await.expect("tick");
        assert_eq!(report.completed, 1);

        let done = state.scheduler.get(&task.id).await.expect("get").expect("task");
        assert_eq!(done.status, skein_core::TaskStatus::Completed);

        let run = state.sync.get_snapshot("run:agent-9");
        assert_eq!(run.status, "completed");
        let tasks = state.sync.get_snapshot("tasks");
        assert_eq!(tasks.seq, 1);
        assert!(!state.coordinator.is_active(&AgentKey::from("agent-9")));
    }
}
