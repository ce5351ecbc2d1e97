//! Agent run coordination
//!
//! - `AgentKey` - Stable identity of a logical agent
//! - `RunType` - Who initiated a run, used for the compatibility policy
//! - `AgentRunCoordinator` - In-memory lease table keyed by agent

mod coordinator;

pub use coordinator::{AcquireOptions, ActiveRun, AgentRunCoordinator, RunLease};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Classification of who initiated an agent execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Interactive request from a user
    User,
    /// Scheduled background wake-up
    Heartbeat,
    /// Nested sub-agent or autonomy run
    Autonomy,
}

impl RunType {
    pub fn all() -> &'static [RunType] {
        &[RunType::User, RunType::Heartbeat, RunType::Autonomy]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::User => "user",
            RunType::Heartbeat => "heartbeat",
            RunType::Autonomy => "autonomy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(RunType::User),
            "heartbeat" => Some(RunType::Heartbeat),
            "autonomy" => Some(RunType::Autonomy),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a logical agent for lease purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentKey(String);

impl AgentKey {
    /// Use the explicit id when present, else derive a deterministic key
    /// from the agent's name and workspace.
    pub fn resolve(explicit_id: Option<&str>, name: &str, workspace: &str) -> Self {
        if let Some(id) = explicit_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Self(id.to_string());
        }
        let mut hasher = Sha256::new();
        hasher.update(name.trim().to_lowercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(workspace.trim().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("agent:{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
