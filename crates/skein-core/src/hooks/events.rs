//! Closed payload shapes for each lifecycle hook

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runs::RunType;

/// Lifecycle extension points of an agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    BeforePrompt,
    AfterPrompt,
    BeforeTool,
    AfterTool,
    StreamChunk,
    FormatError,
    RunEnd,
}

impl HookName {
    pub fn all() -> &'static [HookName] {
        &[
            HookName::BeforePrompt,
            HookName::AfterPrompt,
            HookName::BeforeTool,
            HookName::AfterTool,
            HookName::StreamChunk,
            HookName::FormatError,
            HookName::RunEnd,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::BeforePrompt => "before_prompt",
            HookName::AfterPrompt => "after_prompt",
            HookName::BeforeTool => "before_tool",
            HookName::AfterTool => "after_tool",
            HookName::StreamChunk => "stream_chunk",
            HookName::FormatError => "format_error",
            HookName::RunEnd => "run_end",
        }
    }
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the run an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub agent_key: String,
    pub run_id: String,
    pub run_type: RunType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeforePromptEvent {
    pub run: RunContext,
    pub system_prompt: String,
    pub user_prompt: String,
    pub context_messages: Vec<ContextMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AfterPromptEvent {
    pub run: RunContext,
    pub response: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeforeToolEvent {
    pub run: RunContext,
    pub tool_id: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AfterToolEvent {
    pub run: RunContext,
    pub tool_id: String,
    pub arguments: Value,
    pub result: Value,
    pub is_error: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChunkEvent {
    pub run: RunContext,
    pub chunk: String,
}

/// Handlers may rewrite `formatted_message`; later handlers see the rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct FormatErrorEvent {
    pub run: RunContext,
    pub error: String,
    pub formatted_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEndEvent {
    pub run: RunContext,
    pub outcome: RunOutcome,
    pub output: Option<String>,
}

/// A lifecycle event, mutated in place by each handler in priority order
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookEvent {
    BeforePrompt(BeforePromptEvent),
    AfterPrompt(AfterPromptEvent),
    BeforeTool(BeforeToolEvent),
    AfterTool(AfterToolEvent),
    StreamChunk(StreamChunkEvent),
    FormatError(FormatErrorEvent),
    RunEnd(RunEndEvent),
}

impl HookEvent {
    pub fn name(&self) -> HookName {
        match self {
            HookEvent::BeforePrompt(_) => HookName::BeforePrompt,
            HookEvent::AfterPrompt(_) => HookName::AfterPrompt,
            HookEvent::BeforeTool(_) => HookName::BeforeTool,
            HookEvent::AfterTool(_) => HookName::AfterTool,
            HookEvent::StreamChunk(_) => HookName::StreamChunk,
            HookEvent::FormatError(_) => HookName::FormatError,
            HookEvent::RunEnd(_) => HookName::RunEnd,
        }
    }

    pub fn run(&self) -> &RunContext {
        match self {
            HookEvent::BeforePrompt(e) => &e.run,
            HookEvent::AfterPrompt(e) => &e.run,
            HookEvent::BeforeTool(e) => &e.run,
            HookEvent::AfterTool(e) => &e.run,
            HookEvent::StreamChunk(e) => &e.run,
            HookEvent::FormatError(e) => &e.run,
            HookEvent::RunEnd(e) => &e.run,
        }
    }

    /// Visit every string that leaves the process once the hook chain finishes.
    /// Nested JSON values (tool results) are walked recursively.
    pub fn for_each_outbound_text(&mut self, mut f: impl FnMut(&mut String)) {
        match self {
            HookEvent::BeforePrompt(_) | HookEvent::BeforeTool(_) => {}
            HookEvent::AfterPrompt(e) => f(&mut e.response),
            HookEvent::AfterTool(e) => {
                visit_strings(&mut e.arguments, &mut f);
                visit_strings(&mut e.result, &mut f);
            }
            HookEvent::StreamChunk(e) => f(&mut e.chunk),
            HookEvent::FormatError(e) => {
                f(&mut e.error);
                f(&mut e.formatted_message);
            }
            HookEvent::RunEnd(e) => {
                if let Some(output) = e.output.as_mut() {
                    f(output);
                }
            }
        }
    }
}

fn visit_strings(value: &mut Value, f: &mut impl FnMut(&mut String)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter_mut().for_each(|v| visit_strings(v, f)),
        Value::Object(map) => map.values_mut().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}
