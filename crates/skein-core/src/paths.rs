//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".skein";

/// Get the skein config directory (~/.skein)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the config file (~/.skein/config.toml)
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the durable task table (~/.skein/tasks.json)
pub fn tasks_path() -> PathBuf {
    config_dir().join("tasks.json")
}

/// Get the tokens directory (~/.skein/tokens)
pub fn tokens_dir() -> PathBuf {
    config_dir().join("tokens")
}

/// Get the credentials file (~/.skein/tokens/credentials.json)
pub fn credentials_path() -> PathBuf {
    tokens_dir().join("credentials.json")
}
