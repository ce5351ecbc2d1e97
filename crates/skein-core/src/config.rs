//! Kernel configuration
//!
//! Parsed from `~/.skein/config.toml`. Every field has a default and
//! out-of-range values are clamped rather than rejected, so a partially
//! written config file still yields a usable kernel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths;

pub const MAX_ATTEMPTS_CAP: u32 = 8;
pub const LIST_LIMIT_CAP: usize = 500;
pub const EVENTS_PER_CHANNEL_CAP: usize = 10_000;
/// Upper bound for every millisecond knob: one year
pub const DURATION_MS_CAP: u64 = 365 * 24 * 60 * 60 * 1000;

/// Top-level kernel configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    pub state_sync: StateSyncConfig,
    pub runs: RunsConfig,
    /// Recurring wake-ups, one `[[heartbeats]]` table per agent
    pub heartbeats: Vec<HeartbeatConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_max_attempts: u32,
    pub default_list_limit: usize,
    pub stale_after_ms: u64,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Defaults to `~/.skein/tasks.json` when unset
    pub store_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_list_limit: 100,
            stale_after_ms: 10 * 60 * 1000,
            retry_backoff_ms: 30_000,
            poll_interval_ms: 5_000,
            batch_size: 8,
            store_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(paths::tasks_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSyncConfig {
    pub max_events_per_channel: usize,
    pub stream_heartbeat_ms: u64,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            max_events_per_channel: 300,
            stream_heartbeat_ms: 15_000,
        }
    }
}

impl StateSyncConfig {
    pub fn stream_heartbeat(&self) -> Duration {
        Duration::from_millis(self.stream_heartbeat_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    pub acquire_timeout_ms: u64,
    pub acquire_poll_interval_ms: u64,
    pub lease_max_age_ms: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 10_000,
            acquire_poll_interval_ms: 150,
            lease_max_age_ms: 30 * 60 * 1000,
        }
    }
}

impl RunsConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_interval_ms)
    }

    pub fn lease_max_age(&self) -> Duration {
        Duration::from_millis(self.lease_max_age_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub agent_key: String,
    pub every_ms: u64,
}

impl HeartbeatConfig {
    pub fn every(&self) -> Duration {
        Duration::from_millis(self.every_ms)
    }
}

impl KernelConfig {
    /// Load from `~/.skein/config.toml`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&paths::config_path())
    }

    /// Load from a specific path. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let config: KernelConfig = toml::from_str(contents)?;
        Ok(config.normalized())
    }

    /// Clamp every knob into its supported range
    pub fn normalized(mut self) -> Self {
        let s = &mut self.scheduler;
        s.default_max_attempts = s.default_max_attempts.clamp(1, MAX_ATTEMPTS_CAP);
        s.default_list_limit = s.default_list_limit.clamp(1, LIST_LIMIT_CAP);
        s.stale_after_ms = s.stale_after_ms.clamp(1_000, DURATION_MS_CAP);
        s.retry_backoff_ms = s.retry_backoff_ms.min(DURATION_MS_CAP);
        s.poll_interval_ms = s.poll_interval_ms.clamp(100, DURATION_MS_CAP);
        s.batch_size = s.batch_size.clamp(1, LIST_LIMIT_CAP);

        let sync = &mut self.state_sync;
        sync.max_events_per_channel = sync.max_events_per_channel.clamp(1, EVENTS_PER_CHANNEL_CAP);
        sync.stream_heartbeat_ms = sync.stream_heartbeat_ms.clamp(1_000, DURATION_MS_CAP);

        let runs = &mut self.runs;
        runs.acquire_timeout_ms = runs.acquire_timeout_ms.min(DURATION_MS_CAP);
        runs.acquire_poll_interval_ms = runs.acquire_poll_interval_ms.clamp(10, DURATION_MS_CAP);
        runs.lease_max_age_ms = runs.lease_max_age_ms.clamp(1_000, DURATION_MS_CAP);

        self.heartbeats.retain(|hb| !hb.agent_key.trim().is_empty());
        for hb in &mut self.heartbeats {
            hb.agent_key = hb.agent_key.trim().to_string();
            hb.every_ms = hb.every_ms.clamp(1_000, DURATION_MS_CAP);
        }

        self
    }
}
