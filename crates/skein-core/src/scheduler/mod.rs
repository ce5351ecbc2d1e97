//! Durable task scheduling
//!
//! - `model` - Task records, enqueue input, leases and filters
//! - `store` - Whole-document persistence with sanitized reload
//! - `service` - The serialized, lease-based `TaskScheduler`
//! - `recurring` - Recurring jobs planned as `cron` tasks
//! - `worker` - Drain loop running due tasks through a `TaskHandler`

pub mod model;
pub mod recurring;
pub mod service;
pub mod store;
pub mod worker;

pub use model::{
    EnqueueTaskInput, RepairReport, Task, TaskContext, TaskFilter, TaskKind, TaskLease,
    TaskPayload, TaskResult, TaskStatus,
};
pub use recurring::{recurring_key, RecurringJob, RecurringPlanner};
pub use service::{SchedulerOptions, TaskScheduler};
pub use store::{JsonFileTaskStore, MemoryTaskStore, TaskStore};
pub use worker::{
    publish_task_events, AgentRunHandler, AgentTurn, HookedTurn, TaskHandler, TaskLifecycleEvent,
    TaskWorker, TickReport, WorkerOptions, TASKS_CHANNEL, TASK_COMPLETED, TASK_FAILED,
    TASK_REPAIRED,
};
