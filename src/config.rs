//! Engine configuration.
//!
//! Loaded from JSON; every field has a default so a partial file (or `{}`)
//! is valid. Guardrail constants that peers must agree on live in
//! `events::limits`, not here.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::events::ids::ServerName;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ─── Backfill ────────────────────────────────────────────────────────────────

/// Retry policy for fetching missing history from peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackfillConfig {
    /// Per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Attempts before giving up (events stay pending).
    pub max_attempts: u32,
    /// First retry delay; doubled after each failed attempt.
    pub backoff_base_ms: u64,
    /// Max events requested per attempt.
    pub batch_limit: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 10_000,
            max_attempts: 5,
            backoff_base_ms: 500,
            batch_limit: 100,
        }
    }
}

impl BackfillConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), capped at 64x base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << shift))
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// This server's name; local events are signed as it.
    pub server_name: String,
    /// Log directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Resolved snapshots kept in the LRU cache.
    pub state_cache_capacity: usize,
    /// Events held on missing dependencies, per conversation.
    pub max_pending_per_conversation: usize,
    pub backfill: BackfillConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: String::from("localhost"),
            data_dir: None,
            state_cache_capacity: 1024,
            max_pending_per_conversation: 10_000,
            backfill: BackfillConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_json(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        log::info!(
            "Loaded config for {} from {}",
            config.server_name,
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_name()?;
        if self.state_cache_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "state_cache_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_pending_per_conversation == 0 {
            return Err(ConfigError::Invalid {
                field: "max_pending_per_conversation",
                reason: "must be at least 1".into(),
            });
        }
        if self.backfill.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "backfill.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.backfill.batch_limit == 0 || self.backfill.batch_limit > crate::events::limits::MAX_BACKFILL_BATCH {
            return Err(ConfigError::Invalid {
                field: "backfill.batch_limit",
                reason: format!(
                    "must be between 1 and {}",
                    crate::events::limits::MAX_BACKFILL_BATCH
                ),
            });
        }
        Ok(())
    }

    pub fn server_name(&self) -> Result<ServerName, ConfigError> {
        ServerName::new(&self.server_name).map_err(|e| ConfigError::Invalid {
            field: "server_name",
            reason: e.to_string(),
        })
    }
}
