//! Cache machine configuration options

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How consumers read from a cache machine.
///
/// The mode is fixed at construction; mixing both pull styles on one cache is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsumptionMode {
    /// Entries are materialized into resident batches on pull
    #[default]
    Materialize,
    /// Entries are handed out raw, possibly to several relaying consumers
    Bypass,
}

/// Configuration for a cache machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of queued entries before `add_to_cache` blocks (None = unbounded)
    pub max_batches: Option<usize>,
    /// Resident bytes above which new batches are demoted to host memory
    pub max_resident_bytes: Option<usize>,
    /// Host bytes above which new batches are spilled to `spill_dir`
    pub max_host_bytes: Option<usize>,
    /// Directory receiving spill files
    pub spill_dir: Option<PathBuf>,
    /// Consumption discipline
    pub mode: ConsumptionMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_batches: None,
            max_resident_bytes: None,
            max_host_bytes: None,
            spill_dir: None,
            mode: ConsumptionMode::Materialize,
        }
    }
}

impl CacheConfig {
    /// Bounded queue holding at most `max_batches` entries
    pub fn bounded(max_batches: usize) -> Self {
        Self {
            max_batches: Some(max_batches.max(1)),
            ..Default::default()
        }
    }

    /// Configuration for a cache read through the bypass API
    pub fn bypass() -> Self {
        Self {
            mode: ConsumptionMode::Bypass,
            ..Default::default()
        }
    }

    /// Set the queue bound
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches.max(1));
        self
    }

    /// Set the resident memory limit
    pub fn with_max_resident_bytes(mut self, bytes: usize) -> Self {
        self.max_resident_bytes = Some(bytes);
        self
    }

    /// Set the host memory limit and the directory used once it is exceeded
    pub fn with_spill(mut self, max_host_bytes: usize, dir: impl Into<PathBuf>) -> Self {
        self.max_host_bytes = Some(max_host_bytes);
        self.spill_dir = Some(dir.into());
        self
    }

    /// Set the consumption mode
    pub fn with_mode(mut self, mode: ConsumptionMode) -> Self {
        self.mode = mode;
        self
    }
}
