//! Pull-based sequences over kernel inputs
//!
//! Every kernel reads its input with the same two-call loop:
//!
//! ```ignore
//! while input.wait_for_next() {
//!     let Some(batch) = input.next()? else { break };
//!     // ...
//! }
//! ```

use crate::data_source::{DataHandle, DataLoader, TableSchema};
use arrow::record_batch::RecordBatch;
use query_cache::{CacheData, CacheMachine, ConsumptionMode};
use query_core::{Context, QueryError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Materializing sequence over one cache machine
#[derive(Debug, Default)]
pub struct BatchSequence {
    cache: Option<Arc<CacheMachine>>,
}

impl BatchSequence {
    pub fn new(cache: Arc<CacheMachine>) -> Self {
        Self { cache: Some(cache) }
    }

    pub fn set_source(&mut self, cache: Arc<CacheMachine>) {
        self.cache = Some(cache);
    }

    /// Next batch, or `None` once the producer finished and the cache drained
    pub fn next(&mut self) -> Result<Option<RecordBatch>> {
        match &self.cache {
            Some(cache) => cache.pull_from_cache(),
            None => Err(QueryError::PortNotConnected(
                "batch sequence has no source".to_string(),
            )),
        }
    }

    pub fn wait_for_next(&self) -> bool {
        self.cache
            .as_ref()
            .map(|cache| cache.wait_for_next())
            .unwrap_or(false)
    }

    pub fn has_next_now(&self) -> bool {
        self.cache
            .as_ref()
            .map(|cache| cache.has_next_now())
            .unwrap_or(false)
    }
}

/// Sequence handing out raw cache entries for relaying consumers
#[derive(Debug)]
pub struct BatchSequenceBypass {
    cache: Arc<CacheMachine>,
}

impl BatchSequenceBypass {
    /// Fails unless `cache` was built in bypass mode
    pub fn new(cache: Arc<CacheMachine>) -> Result<Self> {
        if cache.mode() != ConsumptionMode::Bypass {
            return Err(QueryError::CacheModeError(format!(
                "cache '{}' is not in bypass mode",
                cache.name()
            )));
        }
        Ok(Self { cache })
    }

    pub fn next(&mut self) -> Result<Option<CacheData>> {
        self.cache.pull_cache_data()
    }

    pub fn wait_for_next(&self) -> bool {
        self.cache.wait_for_next()
    }

    pub fn has_next_now(&self) -> bool {
        self.cache.has_next_now()
    }
}

/// Scan progress, read by estimators on other threads
#[derive(Debug, Default)]
pub struct BatchProgress {
    batch_index: AtomicUsize,
    num_batches: AtomicUsize,
}

impl BatchProgress {
    pub fn batch_index(&self) -> usize {
        self.batch_index.load(Ordering::Acquire)
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches.load(Ordering::Acquire)
    }

    fn advance(&self) {
        self.batch_index.fetch_add(1, Ordering::AcqRel);
    }

    /// Extrapolate the total row count from the rows produced so far
    pub fn extrapolate(&self, rows_so_far: u64) -> Option<u64> {
        let current = self.batch_index() as f64;
        let total = self.num_batches() as f64;
        if current == 0.0 || total == 0.0 {
            return None;
        }
        Some((rows_so_far as f64 / (current / total)) as u64)
    }
}

/// Batch read from a data source, tagged with the file it came from
#[derive(Debug)]
pub struct SourceBatch {
    pub file_index: usize,
    pub batch: RecordBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceMode {
    /// One batch per (file, row group)
    Files,
    /// No files; one generated batch per logical partition
    Partitions(usize),
    /// No files and no partitions; a single zero-row batch
    Placeholder,
}

/// Sequence that drives a scan over a data loader
#[derive(Debug)]
pub struct DataSourceSequence {
    context: Arc<Context>,
    loader: DataLoader,
    schema: TableSchema,
    projections: Vec<usize>,
    /// (file index, row groups) in read order
    units: Vec<(usize, Vec<usize>)>,
    mode: SourceMode,
    cursor: usize,
    handle: Option<DataHandle>,
    handle_file: Option<usize>,
    progress: Arc<BatchProgress>,
}

impl DataSourceSequence {
    pub fn new(loader: DataLoader, schema: TableSchema, context: Arc<Context>) -> Self {
        let progress = Arc::new(BatchProgress::default());
        let mut units = Vec::new();
        let mode = if schema.files().is_empty() {
            let partitions = loader.parser().num_partitions();
            progress.num_batches.store(partitions, Ordering::Release);
            if partitions == 0 {
                SourceMode::Placeholder
            } else {
                SourceMode::Partitions(partitions)
            }
        } else {
            for file_index in 0..schema.files().len() {
                let row_groups = schema.rowgroup_ids(file_index);
                if row_groups.is_empty() {
                    units.push((file_index, Vec::new()));
                } else {
                    units.extend(row_groups.iter().map(|&rg| (file_index, vec![rg])));
                }
            }
            progress.num_batches.store(units.len(), Ordering::Release);
            SourceMode::Files
        };

        Self {
            context,
            loader,
            schema,
            projections: Vec::new(),
            units,
            mode,
            cursor: 0,
            handle: None,
            handle_file: None,
            progress,
        }
    }

    /// Columns to read; empty reads all of them
    pub fn set_projections(&mut self, projections: Vec<usize>) {
        self.projections = projections;
    }

    pub fn projections(&self) -> &[usize] {
        &self.projections
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn progress(&self) -> Arc<BatchProgress> {
        Arc::clone(&self.progress)
    }

    pub fn batch_index(&self) -> usize {
        self.progress.batch_index()
    }

    pub fn num_batches(&self) -> usize {
        self.progress.num_batches()
    }

    fn total_units(&self) -> usize {
        match self.mode {
            SourceMode::Files => self.units.len(),
            SourceMode::Partitions(n) => n,
            SourceMode::Placeholder => 1,
        }
    }

    /// True while unread units remain. Never blocks.
    pub fn wait_for_next(&self) -> bool {
        self.cursor < self.total_units()
    }

    pub fn has_next_now(&self) -> bool {
        self.wait_for_next()
    }

    /// Read the next unit.
    ///
    /// The cursor moves before the read, so a failure consumes its unit and
    /// the caller may carry on with the next one.
    pub fn next(&mut self) -> Result<Option<SourceBatch>> {
        if !self.wait_for_next() {
            return Ok(None);
        }
        let position = self.cursor;
        self.cursor += 1;

        match self.mode {
            SourceMode::Placeholder => Ok(Some(SourceBatch {
                file_index: 0,
                batch: self.schema.make_empty_batch(&self.projections)?,
            })),
            SourceMode::Partitions(_) => {
                self.progress.advance();
                let batch = self
                    .loader
                    .load_batch(
                        &self.context,
                        &self.projections,
                        &self.schema,
                        &DataHandle::default(),
                        0,
                        &[position],
                    )
                    .map_err(|e| source_error(format!("partition {}", position), e))?;
                Ok(Some(SourceBatch {
                    file_index: 0,
                    batch,
                }))
            }
            SourceMode::Files => {
                self.progress.advance();
                let (file_index, row_groups) = self.units[position].clone();
                let file = self.schema.files()[file_index].clone();
                let handle = self
                    .handle_for(file_index)
                    .map_err(|e| source_error(file.clone(), e))?;
                let batch = self
                    .loader
                    .load_batch(
                        &self.context,
                        &self.projections,
                        &self.schema,
                        &handle,
                        file_index,
                        &row_groups,
                    )
                    .map_err(|e| source_error(file, e))?;
                Ok(Some(SourceBatch { file_index, batch }))
            }
        }
    }

    /// Handle of `file_index`, fetched from the provider once per file.
    ///
    /// The provider must hand out files in schema order; a handle for any
    /// other file is an error.
    fn handle_for(&mut self, file_index: usize) -> Result<DataHandle> {
        if self.handle_file == Some(file_index) {
            return self.handle.clone().ok_or_else(|| {
                QueryError::ExecutionError("file handle could not be opened".to_string())
            });
        }
        self.handle_file = Some(file_index);
        self.handle = None;

        let provider = self.loader.provider_mut();
        if !provider.has_next() {
            return Err(QueryError::ExecutionError(
                "data provider ran out of files".to_string(),
            ));
        }
        let handle = provider.get_next()?;
        let expected = &self.schema.files()[file_index];
        if handle.uri != *expected {
            return Err(QueryError::ExecutionError(format!(
                "data provider handed out '{}' where '{}' was expected",
                handle.uri, expected
            )));
        }
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

fn source_error(file: String, err: QueryError) -> QueryError {
    match err {
        QueryError::SourceReadError { .. } => err,
        other => QueryError::SourceReadError {
            file,
            message: other.to_string(),
        },
    }
}
