//! Recurring jobs planned as `cron` tasks
//!
//! Each job keeps at most one live occurrence in the queue: `plan` enqueues
//! the next occurrence only once the previous one reached a terminal state.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use super::model::{EnqueueTaskInput, Task, TaskContext, TaskKind, TaskPayload};
use super::service::TaskScheduler;
use crate::error::SchedulerError;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Idempotency key of a recurring job's occurrences
pub fn recurring_key(job_key: &str) -> String {
    format!("cron:{job_key}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub key: String,
    pub every: Duration,
    pub payload: TaskPayload,
    pub context: TaskContext,
    pub max_attempts: Option<u32>,
}

impl RecurringJob {
    pub fn new(key: impl Into<String>, every: Duration) -> Self {
        Self {
            key: key.into(),
            every,
            payload: TaskPayload::new(),
            context: TaskContext::new(),
            max_attempts: None,
        }
    }

    /// Periodic wake-up of one agent
    pub fn heartbeat(agent_key: &str, every: Duration) -> Self {
        let mut job = Self::new(format!("heartbeat:{agent_key}"), every);
        job.payload
            .insert("agent_key".to_string(), Value::String(agent_key.to_string()));
        job.payload.insert("reason".to_string(), json!("heartbeat"));
        job.context
            .insert("agent_key".to_string(), agent_key.to_string());
        job
    }

    /// First interval boundary strictly after `now`, aligned to the Unix epoch
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let every_ms = i64::try_from(self.every.as_millis()).unwrap_or(i64::MAX).max(1);
        let now_ms = now.timestamp_millis();
        let next_ms = now_ms
            .div_euclid(every_ms)
            .saturating_add(1)
            .saturating_mul(every_ms);
        Utc.timestamp_millis_opt(next_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Holds recurring job definitions and keeps each one queued
#[derive(Debug, Clone, Default)]
pub struct RecurringPlanner {
    jobs: Vec<RecurringJob>,
}

impl RecurringPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job, replacing any job with the same key
    pub fn add(&mut self, job: RecurringJob) -> Result<(), SchedulerError> {
        if job.key.trim().is_empty() {
            return Err(SchedulerError::validation("recurring job key must not be blank"));
        }
        if job.every < MIN_INTERVAL {
            return Err(SchedulerError::validation(format!(
                "recurring job {} must run at most once per second",
                job.key
            )));
        }
        self.jobs.retain(|existing| existing.key != job.key);
        self.jobs.push(job);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.key != key);
        self.jobs.len() != before
    }

    pub fn jobs(&self) -> &[RecurringJob] {
        &self.jobs
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Enqueue the next occurrence of every job whose previous one is done.
    /// Returns the tasks that were enqueued.
    pub async fn plan(
        &self,
        scheduler: &TaskScheduler,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, SchedulerError> {
        let mut planned = Vec::new();
        for job in &self.jobs {
            let key = recurring_key(&job.key);
            if let Some(existing) = scheduler.get_by_key(&key).await? {
                if !existing.status.is_terminal() {
                    continue;
                }
            }

            let mut context = job.context.clone();
            context.insert("recurring".to_string(), job.key.clone());
            let task = scheduler
                .enqueue(EnqueueTaskInput {
                    key: Some(key),
                    kind: TaskKind::Cron,
                    scheduled_at: Some(job.next_run_after(now)),
                    max_attempts: job.max_attempts,
                    context,
                    payload: job.payload.clone(),
                })
                .await?;
            planned.push(task);
        }
        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::{TaskResult, TaskStatus};
    use crate::scheduler::service::SchedulerOptions;
    use crate::scheduler::store::MemoryTaskStore;
    use std::sync::Arc;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn next_run_is_the_following_epoch_boundary() {
        let job = RecurringJob::new("sync", Duration::from_secs(300));
        assert_eq!(
            job.next_run_after(at("2026-03-01T10:02:13Z")),
            at("2026-03-01T10:05:00Z")
        );
        // Exactly on a boundary moves to the next one.
        assert_eq!(
            job.next_run_after(at("2026-03-01T10:05:00Z")),
            at("2026-03-01T10:10:00Z")
        );
    }

    #[test]
    fn add_validates_and_replaces() {
        let mut planner = RecurringPlanner::new();
        assert!(planner
            .add(RecurringJob::new("fast", Duration::from_millis(10)))
            .is_err());
        assert!(planner.add(RecurringJob::new(" ", Duration::from_secs(60))).is_err());

        planner
            .add(RecurringJob::new("a", Duration::from_secs(60)))
            .expect("add");
        planner
            .add(RecurringJob::new("a", Duration::from_secs(120)))
            .expect("replace");
        assert_eq!(planner.jobs().len(), 1);
        assert_eq!(planner.jobs()[0].every, Duration::from_secs(120));
        assert!(planner.remove("a"));
        assert!(!planner.remove("a"));
    }

    #[tokio::test]
    async fn plan_keeps_one_live_occurrence_per_job() {
        let scheduler = TaskScheduler::new(
            Arc::new(MemoryTaskStore::new()),
            SchedulerOptions::default(),
        );
        let mut planner = RecurringPlanner::new();
        planner
            .add(RecurringJob::heartbeat("agent-1", Duration::from_secs(60)))
            .expect("add");

        let now = at("2026-03-01T10:00:30Z");
        let planned = planner.plan(&scheduler, now).await.expect("plan");
        assert_eq!(planned.len(), 1);
        let task = &planned[0];
        assert_eq!(task.kind, TaskKind::Cron);
        assert_eq!(task.key.as_deref(), Some("cron:heartbeat:agent-1"));
        assert_eq!(task.scheduled_at, at("2026-03-01T10:01:00Z"));
        assert_eq!(task.context["agent_key"], "agent-1");

        assert!(planner.plan(&scheduler, now).await.expect("plan").is_empty());

        let (_, lease) = scheduler
            .acquire_due_tasks(1, at("2026-03-01T10:01:00Z"))
            .await
            .expect("acquire")
            .pop()
            .expect("due");
        scheduler
            .complete(&lease, TaskResult::new())
            .await
            .expect("complete");

        let next = planner
            .plan(&scheduler, at("2026-03-01T10:01:05Z"))
            .await
            .expect("plan");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, task.id);
        assert_eq!(next[0].status, TaskStatus::Queued);
        assert_eq!(next[0].scheduled_at, at("2026-03-01T10:02:00Z"));
    }
}
