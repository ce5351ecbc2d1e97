//! Skein Core
//!
//! Runtime coordination kernel for agent runs:
//! - `runs` - Per-agent run leases with a run-type compatibility policy
//! - `scheduler` - Durable, lease-based task queue with retry and stale repair
//! - `sync` - Per-channel sequenced state events with snapshots and live subscription
//! - `hooks` - Priority-ordered lifecycle hook pipeline around agent turns
//! - `event_bus` - Generic named publish/subscribe primitive
//! - `secrets` - Secret masking and `{{secret:NAME}}` placeholder resolution

pub mod config;
pub mod error;
pub mod event_bus;
pub mod hooks;
pub mod paths;
pub mod runs;
pub mod scheduler;
pub mod secrets;
pub mod storage;
pub mod sync;

pub use config::{HeartbeatConfig, KernelConfig};
pub use error::{ConfigError, SchedulerError, StoreError};
pub use event_bus::EventBus;
pub use hooks::{HookEvent, HookName, HookRegistry};
pub use runs::{AcquireOptions, AgentKey, AgentRunCoordinator, RunLease, RunType};
pub use scheduler::{EnqueueTaskInput, Task, TaskKind, TaskScheduler, TaskStatus};
pub use sync::{ChannelSnapshot, StateSyncService, SyncEvent, SyncFrame};
