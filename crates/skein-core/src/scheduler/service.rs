//! Lease-based task queue
//!
//! Every operation, reads included, runs under one FIFO async mutex, so the
//! in-memory table and the persisted document change one operation at a
//! time. A mutation is applied to a copy of the table, saved, and only then
//! committed; a failed save leaves memory untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::model::{
    EnqueueTaskInput, RepairReport, Task, TaskFilter, TaskLease, TaskResult, TaskStatus,
};
use super::store::TaskStore;
use crate::config::{SchedulerConfig, LIST_LIMIT_CAP, MAX_ATTEMPTS_CAP};
use crate::error::SchedulerError;

const MAX_KEY_LEN: usize = 256;
const TASK_ID_HEX_LEN: usize = 24;

/// Tunables for [`TaskScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub default_max_attempts: u32,
    pub default_list_limit: usize,
    /// Delay before a failed task with attempts left is due again
    pub retry_backoff: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            default_max_attempts: config.default_max_attempts.clamp(1, MAX_ATTEMPTS_CAP),
            default_list_limit: config.default_list_limit.clamp(1, LIST_LIMIT_CAP),
            retry_backoff: config.retry_backoff(),
        }
    }
}

#[derive(Default)]
struct Table {
    loaded: bool,
    tasks: HashMap<String, Task>,
    /// Active lease token per running task. Never persisted.
    leases: HashMap<String, String>,
}

impl Table {
    fn find_by_key(&self, key: &str) -> Option<&Task> {
        self.tasks
            .values()
            .find(|task| task.key.as_deref() == Some(key))
    }

    fn holds(&self, lease: &TaskLease) -> bool {
        self.leases.get(&lease.task_id) == Some(&lease.token)
    }
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    table: Mutex<Table>,
    options: SchedulerOptions,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, options: SchedulerOptions) -> Self {
        Self {
            store,
            table: Mutex::new(Table::default()),
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    async fn lock_loaded(&self) -> Result<tokio::sync::MutexGuard<'_, Table>, SchedulerError> {
        let mut table = self.table.lock().await;
        if !table.loaded {
            table.tasks = self
                .store
                .load()
                .await?
                .into_iter()
                .map(|task| (task.id.clone(), task))
                .collect();
            table.leases.clear();
            table.loaded = true;
        }
        Ok(table)
    }

    async fn persist(&self, tasks: &HashMap<String, Task>) -> Result<(), SchedulerError> {
        let mut rows: Vec<Task> = tasks.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.store.save(&rows).await?;
        Ok(())
    }

    /// Add a task, or update the task sharing its idempotency key.
    ///
    /// A keyed task that already reached a terminal state is reset to
    /// `queued` with a fresh attempt count; a live one is updated in place.
    pub async fn enqueue(&self, input: EnqueueTaskInput) -> Result<Task, SchedulerError> {
        let input = self.validate(input)?;
        let mut table = self.lock_loaded().await?;
        let now = Utc::now();
        let scheduled_at = input.scheduled_at.unwrap_or(now);
        let max_attempts = input
            .max_attempts
            .unwrap_or(self.options.default_max_attempts)
            .clamp(1, MAX_ATTEMPTS_CAP);

        let existing = input
            .key
            .as_deref()
            .and_then(|key| table.find_by_key(key))
            .cloned();

        let task = match existing {
            Some(mut task) => {
                // A live task keeps room for the attempts it already used.
                let floor = match task.status {
                    TaskStatus::Running => task.attempts,
                    TaskStatus::Queued => task.attempts.saturating_add(1),
                    _ => 1,
                };
                if task.status.is_terminal() {
                    task.status = TaskStatus::Queued;
                    task.attempts = 0;
                    task.last_error = None;
                    task.result = None;
                    task.created_at = now;
                    task.started_at = None;
                    task.finished_at = None;
                }
                task.kind = input.kind;
                task.scheduled_at = scheduled_at;
                task.max_attempts = max_attempts.max(floor);
                task.context = input.context;
                task.payload = input.payload;
                task.updated_at = now;
                task
            }
            None => {
                let mut id = derive_task_id(input.key.as_deref(), &input, scheduled_at, now);
                while table.tasks.contains_key(&id) {
                    id = derive_task_id(None, &input, scheduled_at, now);
                }
                Task {
                    id,
                    key: input.key,
                    kind: input.kind,
                    status: TaskStatus::Queued,
                    created_at: now,
                    updated_at: now,
                    scheduled_at,
                    started_at: None,
                    finished_at: None,
                    attempts: 0,
                    max_attempts,
                    context: input.context,
                    payload: input.payload,
                    last_error: None,
                    result: None,
                }
            }
        };

        let mut next = table.tasks.clone();
        next.insert(task.id.clone(), task.clone());
        self.persist(&next).await?;
        table.tasks = next;
        Ok(task)
    }

    fn validate(&self, mut input: EnqueueTaskInput) -> Result<EnqueueTaskInput, SchedulerError> {
        input.key = input
            .key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        if input.key.as_ref().is_some_and(|key| key.len() > MAX_KEY_LEN) {
            return Err(SchedulerError::validation(format!(
                "key must be at most {MAX_KEY_LEN} bytes"
            )));
        }
        if input.kind.requires_schedule() && input.scheduled_at.is_none() {
            return Err(SchedulerError::validation(format!(
                "{} tasks require scheduled_at",
                input.kind
            )));
        }
        if input.max_attempts == Some(0) {
            return Err(SchedulerError::validation("max_attempts must be at least 1"));
        }
        if input.context.keys().any(|name| name.trim().is_empty()) {
            return Err(SchedulerError::validation("context names must not be blank"));
        }
        Ok(input)
    }

    /// Lease up to `limit` queued tasks due at `now`, earliest first.
    ///
    /// This is the only transition into `running`.
    pub async fn acquire_due_tasks(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Task, TaskLease)>, SchedulerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut table = self.lock_loaded().await?;

        let mut due: Vec<&Task> = table
            .tasks
            .values()
            .filter(|task| task.is_due(now) && !table.leases.contains_key(&task.id))
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let selected: Vec<String> = due.into_iter().take(limit).map(|t| t.id.clone()).collect();
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let mut next = table.tasks.clone();
        let mut acquired = Vec::with_capacity(selected.len());
        for id in selected {
            let Some(task) = next.get_mut(&id) else {
                continue;
            };
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            task.finished_at = None;
            task.updated_at = now;
            task.attempts = task.attempts.saturating_add(1);
            let lease = TaskLease {
                task_id: id,
                token: uuid::Uuid::new_v4().simple().to_string(),
            };
            acquired.push((task.clone(), lease));
        }

        self.persist(&next).await?;
        table.tasks = next;
        for (_, lease) in &acquired {
            table.leases.insert(lease.task_id.clone(), lease.token.clone());
        }
        Ok(acquired)
    }

    /// Mark the leased task completed. `None` when the lease is no longer valid.
    pub async fn complete(
        &self,
        lease: &TaskLease,
        result: TaskResult,
    ) -> Result<Option<Task>, SchedulerError> {
        let mut table = self.lock_loaded().await?;
        if !table.holds(lease) {
            return Ok(None);
        }
        let Some(mut task) = table.tasks.get(&lease.task_id).cloned() else {
            table.leases.remove(&lease.task_id);
            return Ok(None);
        };

        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.last_error = None;
        task.result = Some(result);
        task.finished_at = Some(now);
        task.updated_at = now;

        let mut next = table.tasks.clone();
        next.insert(task.id.clone(), task.clone());
        self.persist(&next).await?;
        table.tasks = next;
        table.leases.remove(&lease.task_id);
        Ok(Some(task))
    }

    /// Record a failed attempt. Retries after the backoff while attempts
    /// remain, otherwise the task ends `failed`. `None` when the lease is no
    /// longer valid.
    pub async fn fail(
        &self,
        lease: &TaskLease,
        error: &str,
    ) -> Result<Option<Task>, SchedulerError> {
        let mut table = self.lock_loaded().await?;
        if !table.holds(lease) {
            return Ok(None);
        }
        let Some(mut task) = table.tasks.get(&lease.task_id).cloned() else {
            table.leases.remove(&lease.task_id);
            return Ok(None);
        };

        let now = Utc::now();
        task.last_error = Some(error.to_string());
        task.updated_at = now;
        if task.has_attempts_left() {
            task.status = TaskStatus::Queued;
            task.scheduled_at = later_by(now, self.options.retry_backoff);
            task.started_at = None;
        } else {
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now);
        }

        let mut next = table.tasks.clone();
        next.insert(task.id.clone(), task.clone());
        self.persist(&next).await?;
        table.tasks = next;
        table.leases.remove(&lease.task_id);
        Ok(Some(task))
    }

    /// Cancel a task that has not finished. Terminal tasks are returned
    /// unchanged; unknown ids yield `None`.
    pub async fn cancel(
        &self,
        task_id: &str,
        reason: Option<&str>,
    ) -> Result<Option<Task>, SchedulerError> {
        let mut table = self.lock_loaded().await?;
        let Some(mut task) = table.tasks.get(task_id).cloned() else {
            return Ok(None);
        };
        if task.status.is_terminal() {
            return Ok(Some(task));
        }

        let now = Utc::now();
        task.status = TaskStatus::Cancelled;
        task.last_error = Some(
            reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or("cancelled")
                .to_string(),
        );
        task.finished_at = Some(now);
        task.updated_at = now;

        let mut next = table.tasks.clone();
        next.insert(task.id.clone(), task.clone());
        self.persist(&next).await?;
        table.tasks = next;
        table.leases.remove(task_id);
        Ok(Some(task))
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, SchedulerError> {
        let table = self.lock_loaded().await?;
        Ok(table.tasks.get(task_id).cloned())
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Option<Task>, SchedulerError> {
        let table = self.lock_loaded().await?;
        Ok(table.find_by_key(key.trim()).cloned())
    }

    /// Matching tasks, most recently updated first
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        let limit = filter
            .limit
            .unwrap_or(self.options.default_list_limit)
            .clamp(1, LIST_LIMIT_CAP);
        let table = self.lock_loaded().await?;

        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Reclaim tasks stuck in `running` for longer than `max_age`
    pub async fn repair_stale_running_tasks(
        &self,
        max_age: Duration,
    ) -> Result<RepairReport, SchedulerError> {
        self.repair_stale_running_tasks_at(max_age, Utc::now()).await
    }

    /// Same as [`repair_stale_running_tasks`](Self::repair_stale_running_tasks)
    /// with an explicit clock.
    pub async fn repair_stale_running_tasks_at(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<RepairReport, SchedulerError> {
        let mut table = self.lock_loaded().await?;
        let cutoff = earlier_by(now, max_age);

        let stale: Vec<String> = table
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Running
                    && task.started_at.unwrap_or(task.updated_at) < cutoff
            })
            .map(|task| task.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(RepairReport::default());
        }

        let mut next = table.tasks.clone();
        let mut report = RepairReport::default();
        for id in &stale {
            let Some(task) = next.get_mut(id) else {
                continue;
            };
            task.updated_at = now;
            task.started_at = None;
            if task.has_attempts_left() {
                task.status = TaskStatus::Queued;
                task.scheduled_at = now;
                task.last_error = Some("stale running task requeued".to_string());
                report.requeued.push(task.clone());
            } else {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(now);
                task.last_error = Some("stale running task exceeded max attempts".to_string());
                report.failed.push(task.clone());
            }
        }

        self.persist(&next).await?;
        table.tasks = next;
        for id in &stale {
            table.leases.remove(id);
        }
        Ok(report)
    }
}

fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// `now + duration`, saturating at the end of representable time
fn later_by(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(span(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating at the start of representable time
fn earlier_by(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(span(duration))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `task_` plus a hash of the key (or a random seed), kind, schedule and clock
fn derive_task_id(
    key: Option<&str>,
    input: &EnqueueTaskInput,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> String {
    let seed = match key {
        Some(key) => key.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    let scheduled = scheduled_at.to_rfc3339();
    let stamped = now.to_rfc3339();
    let mut hasher = Sha256::new();
    for part in [seed.as_str(), input.kind.as_str(), scheduled.as_str(), stamped.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("task_{}", &digest[..TASK_ID_HEX_LEN])
}
