use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// String-keyed attributes used for filtering
pub type TaskContext = BTreeMap<String, String>;
/// Opaque work description handed to the task handler
pub type TaskPayload = Map<String, Value>;
/// Structured outcome stored on completion
pub type TaskResult = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Run as soon as possible
    #[default]
    Adhoc,
    /// Run once at a given time
    Planned,
    /// Occurrence of a recurring job
    Cron,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Adhoc => "adhoc",
            TaskKind::Planned => "planned",
            TaskKind::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adhoc" => Some(TaskKind::Adhoc),
            "planned" => Some(TaskKind::Planned),
            "cron" => Some(TaskKind::Cron),
            _ => None,
        }
    }

    /// Planned and cron tasks must say when they are due
    pub fn requires_schedule(&self) -> bool {
        !matches!(self, TaskKind::Adhoc)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of deferred, retryable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Idempotency key; re-enqueueing with the same key reuses this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.scheduled_at <= now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Caller-supplied description of a task to enqueue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnqueueTaskInput {
    pub key: Option<String>,
    pub kind: TaskKind,
    /// Required for planned and cron tasks; adhoc tasks default to now
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Clamped into the supported range; defaults from config
    pub max_attempts: Option<u32>,
    pub context: TaskContext,
    pub payload: TaskPayload,
}

impl EnqueueTaskInput {
    pub fn adhoc() -> Self {
        Self::default()
    }

    pub fn planned(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            kind: TaskKind::Planned,
            scheduled_at: Some(scheduled_at),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }
}

/// Capability to complete or fail one acquisition of a task.
///
/// The token is single-use: once the task completes, fails, is cancelled
/// or is repaired, presenting it again has no effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLease {
    pub task_id: String,
    pub token: String,
}

/// Criteria for [`super::TaskScheduler::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    /// Any of these statuses
    pub statuses: Vec<TaskStatus>,
    pub kind: Option<TaskKind>,
    pub key: Option<String>,
    /// Every pair must be present in the task context
    pub context: TaskContext,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != task.kind) {
            return false;
        }
        if let Some(key) = &self.key {
            if task.key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        self.context
            .iter()
            .all(|(name, value)| task.context.get(name) == Some(value))
    }
}

/// Tasks touched by one stale-task repair pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    pub requeued: Vec<Task>,
    pub failed: Vec<Task>,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}
