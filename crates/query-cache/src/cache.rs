//! Cache machines
//!
//! A [`CacheMachine`] is the only channel between two kernels: a FIFO of
//! [`CacheData`] with a finished flag, guarded by one mutex and two condition
//! variables (data ready, space ready). Producers block while a bounded queue
//! is full, consumers block until an entry arrives or the producer finishes.

use crate::config::{CacheConfig, ConsumptionMode};
use crate::data::{batch_size_bytes, CacheData, CacheDataKind};
use crate::host_table::HostTable;
use crate::stats::CacheStats;
use arrow::record_batch::RecordBatch;
use parking_lot::{Condvar, Mutex};
use query_core::{QueryError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
struct CacheState {
    queue: VecDeque<CacheData>,
    finished: bool,
    cancelled: bool,
    /// Consumer is gone; later pushes are counted and dropped
    discarding: bool,
    /// Bytes of queued resident entries
    resident_bytes: usize,
    /// Bytes of queued host entries
    host_bytes: usize,
}

impl CacheState {
    fn account_insert(&mut self, data: &CacheData) {
        match data.kind() {
            CacheDataKind::Resident => self.resident_bytes += data.size_bytes(),
            CacheDataKind::Host => self.host_bytes += data.size_bytes(),
            CacheDataKind::Spilled => {}
        }
    }

    fn account_remove(&mut self, data: &CacheData) {
        match data.kind() {
            CacheDataKind::Resident => {
                self.resident_bytes = self.resident_bytes.saturating_sub(data.size_bytes())
            }
            CacheDataKind::Host => {
                self.host_bytes = self.host_bytes.saturating_sub(data.size_bytes())
            }
            CacheDataKind::Spilled => {}
        }
    }
}

/// Thread-safe, capacity-aware queue between one producer and its consumers
pub struct CacheMachine {
    name: String,
    config: CacheConfig,
    state: Mutex<CacheState>,
    data_ready: Condvar,
    space_ready: Condvar,
    stats: Arc<CacheStats>,
}

impl CacheMachine {
    /// Create a new cache machine with the given configuration
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CacheState::default()),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Create an unbounded, materializing cache
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CacheConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn mode(&self) -> ConsumptionMode {
        self.config.mode
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Rows pushed so far; read lock-free by progress estimation
    pub fn total_rows_added(&self) -> u64 {
        self.stats.total_rows_added()
    }

    /// Insert at the tail, blocking while a bounded queue is full.
    ///
    /// Fails with `ClosedQueueError` once the cache is finished.
    pub fn add_to_cache(&self, data: CacheData) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(max) = self.config.max_batches {
            while state.queue.len() >= max
                && !state.finished
                && !state.cancelled
                && !state.discarding
            {
                self.space_ready.wait(&mut state);
            }
        }
        if state.cancelled {
            return Err(QueryError::CancelledError(format!(
                "cache '{}' was cancelled",
                self.name
            )));
        }
        if state.finished {
            return Err(QueryError::ClosedQueueError(self.name.clone()));
        }

        self.stats.record_add(data.num_rows(), data.size_bytes());
        if state.discarding {
            return Ok(());
        }
        state.account_insert(&data);
        state.queue.push_back(data);
        self.data_ready.notify_one();
        Ok(())
    }

    /// Insert a freshly produced batch, placing it in the highest tier the limits allow
    pub fn add_batch(&self, batch: RecordBatch) -> Result<()> {
        let data = self.place(batch)?;
        self.add_to_cache(data)
    }

    fn place(&self, batch: RecordBatch) -> Result<CacheData> {
        let size = batch_size_bytes(&batch);
        let data = CacheData::resident(batch);

        let Some(resident_limit) = self.config.max_resident_bytes else {
            return Ok(data);
        };
        let (resident_bytes, host_bytes) = {
            let state = self.state.lock();
            (state.resident_bytes, state.host_bytes)
        };
        if resident_bytes + size <= resident_limit {
            return Ok(data);
        }

        if let (Some(host_limit), Some(dir)) = (self.config.max_host_bytes, &self.config.spill_dir)
        {
            if host_bytes + size > host_limit {
                debug!(
                    "Cache '{}' over host limit ({} + {} > {}), spilling",
                    self.name, host_bytes, size, host_limit
                );
                self.stats.record_spill();
                return data.spill_to(dir);
            }
        }

        debug!(
            "Cache '{}' over resident limit ({} + {} > {}), demoting to host",
            self.name, resident_bytes, size, resident_limit
        );
        self.stats.record_demotion();
        data.demote_to_host()
    }

    /// Blocking pull of the next batch, materialized.
    ///
    /// Returns `Ok(None)` once the cache is finished and drained.
    pub fn pull_from_cache(&self) -> Result<Option<RecordBatch>> {
        if self.config.mode != ConsumptionMode::Materialize {
            return Err(QueryError::CacheModeError(format!(
                "cache '{}' is in bypass mode; use pull_cache_data",
                self.name
            )));
        }
        match self.pop_blocking()? {
            Some(data) => Ok(Some(data.materialize()?)),
            None => Ok(None),
        }
    }

    /// Blocking pull of the next raw entry, without materializing it.
    ///
    /// Safe to call from several relaying consumers; each entry goes to exactly one caller.
    pub fn pull_cache_data(&self) -> Result<Option<CacheData>> {
        if self.config.mode != ConsumptionMode::Bypass {
            return Err(QueryError::CacheModeError(format!(
                "cache '{}' is in materialize mode; use pull_from_cache",
                self.name
            )));
        }
        self.pop_blocking()
    }

    fn pop_blocking(&self) -> Result<Option<CacheData>> {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Err(QueryError::CancelledError(format!(
                    "cache '{}' was cancelled",
                    self.name
                )));
            }
            if let Some(data) = state.queue.pop_front() {
                state.account_remove(&data);
                self.stats.record_pull(data.num_rows());
                self.space_ready.notify_one();
                return Ok(Some(data));
            }
            if state.finished || state.discarding {
                return Ok(None);
            }
            self.data_ready.wait(&mut state);
        }
    }

    /// Block until an entry exists or the stream ended; false iff finished and empty
    pub fn wait_for_next(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return false;
            }
            if !state.queue.is_empty() {
                return true;
            }
            if state.finished || state.discarding {
                return false;
            }
            self.data_ready.wait(&mut state);
        }
    }

    /// Non-blocking readiness probe
    pub fn has_next_now(&self) -> bool {
        let state = self.state.lock();
        !state.cancelled && !state.queue.is_empty()
    }

    /// Mark that no more entries will be pushed. Idempotent.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if !state.finished {
            state.finished = true;
            debug!("Cache '{}' finished: {}", self.name, self.stats);
        }
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// The consumer stopped reading: drop queued entries and accept, without
    /// keeping, everything pushed from now on. The producer runs to completion.
    pub fn discard(&self) {
        let mut state = self.state.lock();
        if !state.discarding {
            state.discarding = true;
            debug!(
                "Cache '{}' discarding {} queued entries",
                self.name,
                state.queue.len()
            );
        }
        state.queue.clear();
        state.resident_bytes = 0;
        state.host_bytes = 0;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Abort the stream: drop queued entries and wake every blocked caller
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.queue.clear();
        state.resident_bytes = 0;
        state.host_bytes = 0;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn is_discarding(&self) -> bool {
        self.state.lock().discarding
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}

impl std::fmt::Debug for CacheMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheMachine")
            .field("name", &self.name)
            .field("mode", &self.config.mode)
            .field("queued", &state.queue.len())
            .field("finished", &state.finished)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

/// Landing zone for batches that arrive from remote nodes.
///
/// Entries are pushed by an exchange listener, not by a local kernel, and the
/// listener is also the one that calls [`HostCacheMachine::finish`].
#[derive(Debug)]
pub struct HostCacheMachine {
    inner: CacheMachine,
}

impl HostCacheMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: CacheMachine::new(name, CacheConfig::bypass()),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        self.inner.stats()
    }

    pub fn add_to_cache(&self, table: HostTable) -> Result<()> {
        self.inner.add_to_cache(CacheData::host(table))
    }

    /// Blocking pull of the next host table; `Ok(None)` at end of stream
    pub fn pull_from_cache(&self) -> Result<Option<HostTable>> {
        match self.inner.pop_blocking()? {
            Some(data) => Ok(Some(data.into_host_table()?)),
            None => Ok(None),
        }
    }

    pub fn wait_for_next(&self) -> bool {
        self.inner.wait_for_next()
    }

    pub fn has_next_now(&self) -> bool {
        self.inner.has_next_now()
    }

    pub fn finish(&self) {
        self.inner.finish()
    }

    pub fn cancel(&self) {
        self.inner.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}
