//! Durable task table
//!
//! The whole table is one JSON document, `{"version": 1, "tasks": [...]}`.
//! Loading never fails on bad content: each task is rebuilt field by field,
//! unusable fields fall back to defaults, unusable tasks are dropped and an
//! unparsable file reads as an empty table.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use super::model::{Task, TaskContext, TaskKind, TaskStatus};
use crate::config::MAX_ATTEMPTS_CAP;
use crate::error::StoreError;
use crate::storage::atomic_write;

pub const TABLE_VERSION: u32 = 1;
const FALLBACK_MAX_ATTEMPTS: u32 = 3;

/// Whole-document persistence for the task table
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Current table. A missing document is an empty table.
    async fn load(&self) -> Result<Vec<Task>, StoreError>;

    async fn save(&self, tasks: &[Task]) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct TaskTableRef<'a> {
    version: u32,
    tasks: &'a [Task],
}

/// Task table stored as a JSON file, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileTaskStore {
    path: PathBuf,
}

impl JsonFileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn load(&self) -> Result<Vec<Task>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        Ok(parse_table(&contents))
    }

    async fn save(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&TaskTableRef {
            version: TABLE_VERSION,
            tasks,
        })?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|join| self.io_error(io::Error::other(join)))?
            .map_err(|err| self.io_error(err))
    }
}

/// In-memory table, for tests and ephemeral deployments
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
    saves: Mutex<usize>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.tasks.lock().clone())
    }

    async fn save(&self, tasks: &[Task]) -> Result<(), StoreError> {
        *self.tasks.lock() = tasks.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Parse a stored table, degrading to whatever can be salvaged
pub fn parse_table(contents: &str) -> Vec<Task> {
    if contents.trim().is_empty() {
        return Vec::new();
    }
    let Ok(raw) = serde_json::from_str::<Value>(contents) else {
        return Vec::new();
    };
    let entries = match raw {
        Value::Object(mut table) => match table.remove("tasks") {
            Some(Value::Array(entries)) => entries,
            _ => return Vec::new(),
        },
        // Bare arrays are accepted as a table without a header.
        Value::Array(entries) => entries,
        _ => return Vec::new(),
    };

    let now = Utc::now();
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::Object(fields) => sanitize_task(&fields, now),
            _ => None,
        })
        .filter(|task| seen.insert(task.id.clone()))
        .collect()
}

/// Rebuild one task from untrusted fields. Returns `None` without an id.
pub fn sanitize_task(fields: &Map<String, Value>, now: DateTime<Utc>) -> Option<Task> {
    let id = non_empty_str(fields.get("id"))?;

    let created_at = timestamp(fields.get("created_at")).unwrap_or(now);
    let updated_at = timestamp(fields.get("updated_at")).unwrap_or(created_at);
    let scheduled_at = timestamp(fields.get("scheduled_at")).unwrap_or(created_at);
    let status = fields
        .get("status")
        .and_then(Value::as_str)
        .and_then(TaskStatus::parse)
        .unwrap_or_default();

    let mut started_at = timestamp(fields.get("started_at"));
    if status == TaskStatus::Running && started_at.is_none() {
        // Keeps the task eligible for stale repair.
        started_at = Some(updated_at);
    }

    let max_attempts = fields
        .get("max_attempts")
        .and_then(Value::as_u64)
        .map(|n| n.clamp(1, u64::from(MAX_ATTEMPTS_CAP)) as u32)
        .unwrap_or(FALLBACK_MAX_ATTEMPTS);
    let attempts = fields
        .get("attempts")
        .and_then(Value::as_u64)
        .map(|n| n.min(u64::from(max_attempts)) as u32)
        .unwrap_or(0);

    Some(Task {
        id,
        key: non_empty_str(fields.get("key")),
        kind: fields
            .get("kind")
            .and_then(Value::as_str)
            .and_then(TaskKind::parse)
            .unwrap_or_default(),
        status,
        created_at,
        updated_at,
        scheduled_at,
        started_at,
        finished_at: timestamp(fields.get("finished_at")),
        attempts,
        max_attempts,
        context: context_map(fields.get("context")),
        payload: object(fields.get("payload")).unwrap_or_default(),
        last_error: non_empty_str(fields.get("last_error")),
        result: object(fields.get("result")),
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn object(value: Option<&Value>) -> Option<Map<String, Value>> {
    value.and_then(Value::as_object).cloned()
}

fn context_map(value: Option<&Value>) -> TaskContext {
    let Some(Value::Object(entries)) = value else {
        return TaskContext::new();
    };
    entries
        .iter()
        .filter_map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((name.clone(), value))
        })
        .collect()
}
