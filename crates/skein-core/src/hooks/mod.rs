//! Lifecycle hook pipeline
//!
//! Handlers run around every agent turn, in ascending priority, and may
//! mutate the event so later handlers observe earlier rewrites.
//!
//! ## Built-in consumers
//! - `TracingHook` - Logs prompt/tool timing and run outcomes
//! - `StateSyncHook` - Publishes lifecycle events to the run's sync channel
//! - `SecretRedactionHook` (in `crate::secrets`) - Resolves and masks secrets

mod builtin;
mod events;
mod registry;

pub use builtin::{
    install_default_hooks, run_channel, StateSyncHook, TracingHook, STATE_SYNC_PRIORITY,
    TRACING_PRIORITY,
};
pub use events::{
    AfterPromptEvent, AfterToolEvent, BeforePromptEvent, BeforeToolEvent, ContextMessage,
    FormatErrorEvent, HookEvent, HookName, RunContext, RunEndEvent, RunOutcome, StreamChunkEvent,
};
pub use registry::{
    FnHook, HookFailure, HookHandler, HookRegistration, HookRegistry, HookReport, RegisterOptions,
};
