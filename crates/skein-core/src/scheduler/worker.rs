//! Background drain loop for the task scheduler
//!
//! Each tick repairs stale running tasks, plans recurring occurrences, leases
//! due tasks and runs them through a [`TaskHandler`]. Outcomes are reported
//! back to the scheduler and announced on an [`EventBus`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::model::{RepairReport, Task, TaskKind, TaskLease, TaskResult, TaskStatus};
use super::recurring::RecurringPlanner;
use super::service::TaskScheduler;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::event_bus::EventBus;
use crate::hooks::{BeforePromptEvent, HookEvent, HookRegistry, RunContext, RunEndEvent, RunOutcome};
use crate::runs::{AgentKey, AgentRunCoordinator, RunLease, RunType};
use crate::sync::StateSyncService;

pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const TASK_REPAIRED: &str = "task.repaired";

/// Sync channel mirroring task lifecycle events
pub const TASKS_CHANNEL: &str = "tasks";

/// Executes one leased task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task) -> anyhow::Result<TaskResult>;
}

/// Lifecycle notification published on the worker's event bus
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLifecycleEvent {
    pub task_id: String,
    pub key: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

impl From<&Task> for TaskLifecycleEvent {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            key: task.key.clone(),
            kind: task.kind,
            status: task.status,
            attempts: task.attempts,
            error: task.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub batch_size: usize,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for WorkerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            stale_after: config.stale_after(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// What one [`TaskWorker::tick`] did
#[derive(Debug, Default)]
pub struct TickReport {
    pub repaired: RepairReport,
    pub planned: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes dropped because the lease was revoked meanwhile
    pub lost: usize,
}

enum Outcome {
    Completed,
    Retried,
    Failed,
    Lost,
}

pub struct TaskWorker {
    scheduler: Arc<TaskScheduler>,
    handler: Arc<dyn TaskHandler>,
    events: Arc<EventBus<TaskLifecycleEvent>>,
    planner: RecurringPlanner,
    options: WorkerOptions,
}

impl TaskWorker {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        handler: Arc<dyn TaskHandler>,
        events: Arc<EventBus<TaskLifecycleEvent>>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            scheduler,
            handler,
            events,
            planner: RecurringPlanner::new(),
            options,
        }
    }

    pub fn with_planner(mut self, planner: RecurringPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn events(&self) -> &Arc<EventBus<TaskLifecycleEvent>> {
        &self.events
    }

    /// One drain cycle at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport {
            repaired: self
                .scheduler
                .repair_stale_running_tasks_at(self.options.stale_after, now)
                .await?,
            ..TickReport::default()
        };
        for task in report.repaired.requeued.iter().chain(&report.repaired.failed) {
            tracing::warn!(
                task_id = %task.id,
                status = %task.status,
                attempts = task.attempts,
                "Repaired stale running task"
            );
            self.events.emit(TASK_REPAIRED, task.into()).await;
        }

        report.planned = self.planner.plan(&self.scheduler, now).await?.len();

        let acquired = self
            .scheduler
            .acquire_due_tasks(self.options.batch_size, now)
            .await?;
        let outcomes = join_all(
            acquired
                .into_iter()
                .map(|(task, lease)| self.execute(task, lease)),
        )
        .await;

        for outcome in outcomes {
            match outcome? {
                Outcome::Completed => report.completed += 1,
                Outcome::Retried => report.retried += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Lost => report.lost += 1,
            }
        }
        Ok(report)
    }

    async fn execute(&self, task: Task, lease: TaskLease) -> Result<Outcome, SchedulerError> {
        let started = std::time::Instant::now();
        let result = match AssertUnwindSafe(self.handler.run(&task)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("task handler panicked")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let Some(done) = self.scheduler.complete(&lease, output).await? else {
                    tracing::warn!(task_id = %task.id, "Task lease revoked before completion");
                    return Ok(Outcome::Lost);
                };
                tracing::info!(
                    task_id = %done.id,
                    kind = %done.kind,
                    attempts = done.attempts,
                    duration_ms,
                    "Task completed"
                );
                self.events.emit(TASK_COMPLETED, (&done).into()).await;
                Ok(Outcome::Completed)
            }
            Err(err) => {
                let message = format!("{err:#}");
                let Some(failed) = self.scheduler.fail(&lease, &message).await? else {
                    tracing::warn!(task_id = %task.id, "Task lease revoked before failure");
                    return Ok(Outcome::Lost);
                };
                tracing::warn!(
                    task_id = %failed.id,
                    attempts = failed.attempts,
                    max_attempts = failed.max_attempts,
                    status = %failed.status,
                    duration_ms,
                    error = %message,
                    "Task attempt failed"
                );
                self.events.emit(TASK_FAILED, (&failed).into()).await;
                if failed.status == TaskStatus::Failed {
                    Ok(Outcome::Failed)
                } else {
                    Ok(Outcome::Retried)
                }
            }
        }
    }

    /// Tick every poll interval until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Task worker stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.completed + report.retried + report.failed > 0 => {
                            tracing::debug!(
                                completed = report.completed,
                                retried = report.retried,
                                failed = report.failed,
                                "Task worker tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Task worker tick failed: {}", e),
                    }
                }
            }
        }
    }
}

/// Mirror task lifecycle events onto the [`TASKS_CHANNEL`] sync channel
pub fn publish_task_events(events: &EventBus<TaskLifecycleEvent>, sync: &StateSyncService) {
    for name in [TASK_COMPLETED, TASK_FAILED, TASK_REPAIRED] {
        let sync = sync.clone();
        events.on(name, move |event: TaskLifecycleEvent| {
            let sync = sync.clone();
            async move {
                let payload = serde_json::to_value(&event)?;
                sync.publish(TASKS_CHANNEL, name, payload, Some(event.status.as_str()));
                Ok::<(), anyhow::Error>(())
            }
        });
    }
}

/// One agent turn driven by a background task, executed while holding the
/// agent's run lease
#[async_trait]
pub trait AgentTurn: Send + Sync {
    async fn execute(&self, lease: &RunLease, task: &Task) -> anyhow::Result<TaskResult>;
}

/// Runs agent tasks under the run coordinator: `heartbeat` for cron tasks,
/// `autonomy` otherwise. A busy agent fails the attempt so it is retried.
pub struct AgentRunHandler {
    coordinator: AgentRunCoordinator,
    turn: Arc<dyn AgentTurn>,
}

impl AgentRunHandler {
    pub fn new(coordinator: AgentRunCoordinator, turn: Arc<dyn AgentTurn>) -> Self {
        Self { coordinator, turn }
    }

    pub fn run_type_for(kind: TaskKind) -> RunType {
        match kind {
            TaskKind::Cron => RunType::Heartbeat,
            TaskKind::Adhoc | TaskKind::Planned => RunType::Autonomy,
        }
    }

    fn agent_key(task: &Task) -> Option<AgentKey> {
        task.payload
            .get("agent_key")
            .and_then(Value::as_str)
            .or_else(|| task.context.get("agent_key").map(String::as_str))
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(AgentKey::from)
    }
}

#[async_trait]
impl TaskHandler for AgentRunHandler {
    async fn run(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let agent_key = Self::agent_key(task)
            .ok_or_else(|| anyhow::anyhow!("task {} names no agent_key", task.id))?;
        let run_type = Self::run_type_for(task.kind);

        let lease = self
            .coordinator
            .try_acquire(&agent_key, run_type, &[])
            .ok_or_else(|| anyhow::anyhow!("agent {agent_key} is busy"))?;
        let result = self.turn.execute(&lease, task).await;
        lease.release();
        result
    }
}

/// Drives a background turn through the lifecycle hook pipeline without a
/// language model: it announces the prompt and reports the run end, so
/// observers of the run channel see scheduled wake-ups happen.
#[derive(Debug, Clone)]
pub struct HookedTurn {
    hooks: HookRegistry,
}

impl HookedTurn {
    pub fn new(hooks: HookRegistry) -> Self {
        Self { hooks }
    }
}

#[async_trait]
impl AgentTurn for HookedTurn {
    async fn execute(&self, lease: &RunLease, task: &Task) -> anyhow::Result<TaskResult> {
        let run = RunContext {
            agent_key: lease.agent_key().to_string(),
            run_id: lease.run_id().to_string(),
            run_type: lease.run_type(),
        };
        let prompt = task
            .payload
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut before = HookEvent::BeforePrompt(BeforePromptEvent {
            run: run.clone(),
            system_prompt: String::new(),
            user_prompt: prompt,
            context_messages: Vec::new(),
        });
        self.hooks.emit(&mut before).await;

        let mut end = HookEvent::RunEnd(RunEndEvent {
            run,
            outcome: RunOutcome::Completed,
            output: None,
        });
        self.hooks.emit(&mut end).await;

        let mut result = TaskResult::new();
        result.insert("run_id".to_string(), json!(lease.run_id()));
        result.insert("run_type".to_string(), json!(lease.run_type()));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{install_default_hooks, run_channel};
    use crate::scheduler::model::EnqueueTaskInput;
    use crate::scheduler::service::SchedulerOptions;
    use crate::scheduler::store::MemoryTaskStore;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, task: &Task) -> anyhow::Result<TaskResult> {
            let mut result = TaskResult::new();
            result.insert("echo".to_string(), json!(task.id));
            Ok(result)
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler for Failing {
        async fn run(&self, _task: &Task) -> anyhow::Result<TaskResult> {
            Err(anyhow::anyhow!("downstream unavailable"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskHandler for Panicking {
        async fn run(&self, _task: &Task) -> anyhow::Result<TaskResult> {
            panic!("handler bug")
        }
    }

    fn scheduler() -> Arc<TaskScheduler> {
        Arc::new(TaskScheduler::new(
            Arc::new(MemoryTaskStore::new()),
            SchedulerOptions::default(),
        ))
    }

    fn worker(scheduler: &Arc<TaskScheduler>, handler: Arc<dyn TaskHandler>) -> TaskWorker {
        TaskWorker::new(
            Arc::clone(scheduler),
            handler,
            Arc::new(EventBus::new()),
            WorkerOptions::default(),
        )
    }

    #[tokio::test]
    async fn tick_completes_due_tasks_and_announces_them() {
        let scheduler = scheduler();
        let worker = worker(&scheduler, Arc::new(Echo));
        let sync = StateSyncService::default();
        publish_task_events(worker.events(), &sync);

        let task = scheduler
            .enqueue(EnqueueTaskInput::adhoc())
            .await
            .expect("enqueue");
        let report = worker.tick(Utc::now()).await.expect("tick");
        assert_eq!(report.completed, 1);

        let done = scheduler.get(&task.id).await.expect("get").expect("exists");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.expect("result")["echo"], json!(task.id));

        let events = sync.get_events_since(TASKS_CHANNEL, 0, 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, TASK_COMPLETED);
        assert_eq!(events[0].status, "completed");
        assert_eq!(events[0].payload["task_id"], json!(task.id));
    }

    #[tokio::test]
    async fn errors_and_panics_count_as_failed_attempts() {
        let scheduler = scheduler();
        scheduler
            .enqueue(EnqueueTaskInput::adhoc().with_key("flaky").with_max_attempts(2))
            .await
            .expect("enqueue");

        let failing = worker(&scheduler, Arc::new(Failing));
        let report = failing.tick(Utc::now()).await.expect("tick");
        assert_eq!(report.retried, 1);

        let panicking = worker(&scheduler, Arc::new(Panicking));
        let later = Utc::now() + chrono::Duration::minutes(5);
        let report = panicking.tick(later).await.expect("tick");
        assert_eq!(report.failed, 1);

        let task = scheduler
            .get_by_key("flaky")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error.as_deref(), Some("task handler panicked"));
    }

    #[tokio::test]
    async fn tick_repairs_stale_tasks_before_acquiring() {
        let scheduler = scheduler();
        let task = scheduler
            .enqueue(EnqueueTaskInput::adhoc().with_max_attempts(2))
            .await
            .expect("enqueue");
        let now = Utc::now();
        let orphaned = scheduler.acquire_due_tasks(1, now).await.expect("acquire");
        assert_eq!(orphaned.len(), 1);

        let worker = worker(&scheduler, Arc::new(Echo));
        let repaired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&repaired);
        worker.events().on(TASK_REPAIRED, move |event: TaskLifecycleEvent| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event.task_id);
                Ok(())
            }
        });

        let report = worker
            .tick(now + chrono::Duration::minutes(30))
            .await
            .expect("tick");
        assert_eq!(report.repaired.requeued.len(), 1);
        assert_eq!(report.completed, 1);
        assert_eq!(*repaired.lock(), vec![task.id.clone()]);
    }

    #[tokio::test]
    async fn agent_tasks_run_under_a_lease_and_retry_when_busy() {
        let scheduler = scheduler();
        let coordinator = AgentRunCoordinator::new();
        let hooks = HookRegistry::new();
        let sync = StateSyncService::default();
        install_default_hooks(&hooks, &HashMap::new(), &sync);
        let handler = AgentRunHandler::new(coordinator.clone(), Arc::new(HookedTurn::new(hooks)));
        let worker = worker(&scheduler, Arc::new(handler));

        let now = Utc::now();
        let task = scheduler
            .enqueue(EnqueueTaskInput {
                kind: TaskKind::Cron,
                scheduled_at: Some(now),
                ..EnqueueTaskInput::adhoc().with_payload("agent_key", json!("agent-9"))
            })
            .await
            .expect("enqueue");

        let agent = AgentKey::from("agent-9");
        let user_run = coordinator
            .try_acquire(&agent, RunType::User, &[])
            .expect("user run");
        let report = worker.tick(now).await.expect("tick");
        assert_eq!(report.retried, 1);
        let busy = scheduler.get(&task.id).await.expect("get").expect("exists");
        assert_eq!(busy.status, TaskStatus::Queued);
        assert!(busy
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("busy")));
        drop(user_run);

        let report = worker
            .tick(now + chrono::Duration::minutes(1))
            .await
            .expect("tick");
        assert_eq!(report.completed, 1);
        let done = scheduler.get(&task.id).await.expect("get").expect("exists");
        assert_eq!(done.result.expect("result")["run_type"], json!("heartbeat"));
        assert!(!coordinator.is_active(&agent));

        let run_events = sync.get_events_since(&run_channel("agent-9"), 0, 10);
        let types: Vec<&str> = run_events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["prompt.before", "run.end"]);
    }

    #[tokio::test]
    async fn task_without_agent_key_fails() {
        let handler = AgentRunHandler::new(
            AgentRunCoordinator::new(),
            Arc::new(HookedTurn::new(HookRegistry::new())),
        );
        let scheduler = scheduler();
        let task = scheduler
            .enqueue(EnqueueTaskInput::adhoc())
            .await
            .expect("enqueue");
        let err = handler.run(&task).await.expect_err("no agent");
        assert!(err.to_string().contains("agent_key"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let scheduler = scheduler();
        let worker = Arc::new(worker(&scheduler, Arc::new(Echo)));
        let shutdown = CancellationToken::new();

        let handle = {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        };

        scheduler
            .enqueue(EnqueueTaskInput::adhoc().with_key("looped"))
            .await
            .expect("enqueue");
        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown.cancel();
        handle.await.expect("worker exits");

        let task = scheduler
            .get_by_key("looped")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(task.status, TaskStatus::Completed);
    }
}
