//! Engine configuration.
//!
//! Loaded from TOML; every key is optional.
//!
//! ```toml
//! session_timeout_ms = 1000
//! max_detached_sessions = 64
//! default_request_behavior = "no_request_with_timeout"
//! store_path = "/var/cache/feedsync/store.lst"
//! log_filter = "feedsync=debug"
//! ```

use crate::error::{Result, SyncError};
use crate::session::RequestBehavior;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default timeout for the `*WithTimeout` request behaviours
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 1000;

/// Detached sessions kept in memory before the oldest is invalidated
pub const DEFAULT_MAX_DETACHED_SESSIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a session waits for an outstanding request before becoming Ready
    pub session_timeout_ms: u64,

    /// Cap on detached sessions held for reattachment
    pub max_detached_sessions: usize,

    /// Behaviour returned by the default scheduler
    pub default_request_behavior: RequestBehavior,

    /// Location of the file-backed content store (in-memory when unset)
    pub store_path: Option<PathBuf>,

    /// Filter used by `logging::init` when no env override is present
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            max_detached_sessions: DEFAULT_MAX_DETACHED_SESSIONS,
            default_request_behavior: RequestBehavior::NoRequestWithContent,
            store_path: None,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| SyncError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_ms == 0 {
            return Err(SyncError::Config(
                "session_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Configured store path, falling back to `<cache_dir>/feedsync/store.lst`
    pub fn resolved_store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => default_store_path(),
        }
    }
}

/// Get the default store location (~/.cache/feedsync/store.lst)
pub fn default_store_path() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir().ok_or_else(|| {
        SyncError::Config("Cannot determine cache directory (HOME not set)".to_string())
    })?;
    Ok(cache_dir.join("feedsync").join("store.lst"))
}
