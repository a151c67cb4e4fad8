//! Engine configuration

use query_cache::CacheConfig;
use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by every execution graph of a process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache settings for graph edges that do not specify their own
    pub cache: CacheConfig,
    /// How often an exchange listener wakes up to check for shutdown
    pub listener_poll_interval_ms: u64,
    /// Give up on remote senders after this long without any message
    pub remote_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            listener_poll_interval_ms: 100,
            remote_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .map_err(|e| QueryError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| QueryError::SerializationError(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listener_poll_interval_ms == 0 {
            return Err(QueryError::InvalidConfig(
                "listener_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.cache.max_batches == Some(0) {
            return Err(QueryError::InvalidConfig(
                "cache.max_batches must be positive".to_string(),
            ));
        }
        if self.cache.max_host_bytes.is_some() && self.cache.spill_dir.is_none() {
            return Err(QueryError::InvalidConfig(
                "cache.max_host_bytes requires cache.spill_dir".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_listener_poll_interval_ms(mut self, ms: u64) -> Self {
        self.listener_poll_interval_ms = ms.max(1);
        self
    }

    pub fn with_remote_timeout_ms(mut self, ms: u64) -> Self {
        self.remote_timeout_ms = Some(ms);
        self
    }

    pub fn listener_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listener_poll_interval_ms)
    }

    pub fn remote_timeout(&self) -> Option<Duration> {
        self.remote_timeout_ms.map(Duration::from_millis)
    }
}
