//! Provider credential storage
//!
//! Secrets are stored per provider id in a JSON file and double as the
//! source of truth for output masking and `{{secret:NAME}}` resolution.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::paths;

/// Secrets indexed by provider id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStore {
    #[serde(flatten)]
    keys: HashMap<String, String>,
}

impl CredentialStore {
    /// Load from `~/.skein/tokens/credentials.json`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&paths::credentials_path())
    }

    /// Load from a specific path. A missing file is an empty store.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_path(&paths::credentials_path())
    }

    /// Save to a specific path, readable only by the owner on Unix
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        super::atomic_write(path, contents.as_bytes())
            .with_context(|| format!("Failed to write credentials: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = fs::set_permissions(path, permissions);
            }
        }
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    /// Blank secrets are ignored
    pub fn set(&mut self, provider: impl Into<String>, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return;
        }
        self.keys.insert(provider.into(), secret);
    }

    pub fn remove(&mut self, provider: &str) -> Option<String> {
        self.keys.remove(provider)
    }

    /// Provider ids with a stored secret, sorted
    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        providers.sort_unstable();
        providers
    }

    /// Mapping consumed by the secret redaction hook
    pub fn secrets(&self) -> &HashMap<String, String> {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
