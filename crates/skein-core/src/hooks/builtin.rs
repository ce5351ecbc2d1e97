//! Default hook consumers

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::events::{HookEvent, HookName, RunOutcome};
use super::registry::{HookHandler, HookRegistration, HookRegistry, RegisterOptions};
use crate::secrets::SecretRedactionHook;
use crate::sync::StateSyncService;

pub const TRACING_PRIORITY: i32 = 0;
/// Runs after masking so only redacted data is published
pub const STATE_SYNC_PRIORITY: i32 = 200;

/// Sync channel that carries one run's lifecycle events
pub fn run_channel(agent_key: &str) -> String {
    format!("run:{agent_key}")
}

/// Logs every lifecycle event with structured fields
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl TracingHook {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HookHandler for TracingHook {
    async fn handle(&self, event: &mut HookEvent) -> anyhow::Result<()> {
        let run = event.run();
        let agent_key = run.agent_key.as_str();
        let run_id = run.run_id.as_str();

        match &*event {
            HookEvent::BeforePrompt(e) => tracing::debug!(
                agent_key,
                run_id,
                run_type = %e.run.run_type,
                context_messages = e.context_messages.len(),
                prompt_len = e.user_prompt.len(),
                "Prompt starting"
            ),
            HookEvent::AfterPrompt(e) => tracing::info!(
                agent_key,
                run_id,
                duration_ms = e.duration.as_millis() as u64,
                response_len = e.response.len(),
                "Prompt completed"
            ),
            HookEvent::BeforeTool(e) => {
                tracing::debug!(agent_key, run_id, tool = %e.tool_id, "Tool starting")
            }
            HookEvent::AfterTool(e) => tracing::info!(
                agent_key,
                run_id,
                tool = %e.tool_id,
                duration_ms = e.duration.as_millis() as u64,
                is_error = e.is_error,
                "Tool execution completed"
            ),
            HookEvent::StreamChunk(e) => {
                tracing::trace!(agent_key, run_id, chunk_len = e.chunk.len(), "Stream chunk")
            }
            HookEvent::FormatError(e) => {
                tracing::warn!(agent_key, run_id, error = %e.error, "Run error")
            }
            HookEvent::RunEnd(e) => tracing::info!(
                agent_key,
                run_id,
                outcome = ?e.outcome,
                "Run finished"
            ),
        }
        Ok(())
    }
}

/// Mirrors lifecycle events onto the `run:<agent_key>` sync channel
#[derive(Debug, Clone)]
pub struct StateSyncHook {
    sync: StateSyncService,
}

impl StateSyncHook {
    pub fn new(sync: StateSyncService) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl HookHandler for StateSyncHook {
    async fn handle(&self, event: &mut HookEvent) -> anyhow::Result<()> {
        let run = event.run();
        let channel = run_channel(&run.agent_key);
        let run_id = run.run_id.clone();
        let run_type = run.run_type;

        // Prompts and tool arguments are not masked yet on the "before" hooks,
        // so only their shape is published.
        let (event_type, status, payload) = match &*event {
            HookEvent::BeforePrompt(e) => (
                "prompt.before",
                "running",
                json!({
                    "run_id": run_id,
                    "run_type": run_type,
                    "context_messages": e.context_messages.len(),
                    "prompt_len": e.user_prompt.len(),
                }),
            ),
            HookEvent::AfterPrompt(e) => (
                "prompt.after",
                "running",
                json!({
                    "run_id": run_id,
                    "response": e.response,
                    "duration_ms": e.duration.as_millis() as u64,
                }),
            ),
            HookEvent::BeforeTool(e) => (
                "tool.before",
                "running",
                json!({ "run_id": run_id, "tool_id": e.tool_id }),
            ),
            HookEvent::AfterTool(e) => (
                "tool.after",
                "running",
                json!({
                    "run_id": run_id,
                    "tool_id": e.tool_id,
                    "arguments": e.arguments,
                    "result": e.result,
                    "is_error": e.is_error,
                    "duration_ms": e.duration.as_millis() as u64,
                }),
            ),
            HookEvent::StreamChunk(e) => (
                "stream.chunk",
                "running",
                json!({ "run_id": run_id, "chunk": e.chunk }),
            ),
            HookEvent::FormatError(e) => (
                "error",
                "failed",
                json!({
                    "run_id": run_id,
                    "error": e.error,
                    "message": e.formatted_message,
                }),
            ),
            HookEvent::RunEnd(e) => (
                "run.end",
                match e.outcome {
                    RunOutcome::Completed => "completed",
                    RunOutcome::Failed | RunOutcome::Cancelled => "failed",
                },
                json!({
                    "run_id": run_id,
                    "run_type": run_type,
                    "outcome": e.outcome,
                    "output": e.output,
                }),
            ),
        };

        self.sync.publish(&channel, event_type, payload, Some(status));
        Ok(())
    }
}

/// Register secret redaction, tracing and state publishing on every hook
pub fn install_default_hooks(
    registry: &HookRegistry,
    secrets: &HashMap<String, String>,
    sync: &StateSyncService,
) -> Vec<HookRegistration> {
    let mut registrations = Arc::new(SecretRedactionHook::new(secrets)).install(registry);
    registrations.extend(registry.register_many(
        HookName::all(),
        Arc::new(TracingHook::new()),
        RegisterOptions::priority(TRACING_PRIORITY).with_id("tracing"),
    ));
    registrations.extend(registry.register_many(
        HookName::all(),
        Arc::new(StateSyncHook::new(sync.clone())),
        RegisterOptions::priority(STATE_SYNC_PRIORITY).with_id("state_sync"),
    ));
    registrations
}
