//! Kernel contract
//!
//! A kernel is one operator of the execution graph. It owns named input
//! caches and exactly one output cache, and its `run` drains the inputs until
//! the upstream producers finish. Kernels never call each other.

use crate::sequence::BatchSequence;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use query_cache::{CacheData, CacheMachine};
use query_core::{Context, QueryError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Port name used by single-input kernels
pub const DEFAULT_PORT: &str = "input";

static NEXT_KERNEL_ID: AtomicU64 = AtomicU64::new(0);

pub type KernelId = u64;

/// Outcome of a completed `run`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    /// Downstream kernels should keep going
    Proceed,
    /// Terminal sink
    Stop,
}

/// Lifecycle of a kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelState {
    Created = 0,
    Running = 1,
    Proceed = 2,
    Stop = 3,
}

impl KernelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => KernelState::Running,
            2 => KernelState::Proceed,
            3 => KernelState::Stop,
            _ => KernelState::Created,
        }
    }
}

impl From<KernelStatus> for KernelState {
    fn from(status: KernelStatus) -> Self {
        match status {
            KernelStatus::Proceed => KernelState::Proceed,
            KernelStatus::Stop => KernelState::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelType {
    TableScan,
    BindableTableScan,
    Projection,
    Filter,
    Print,
    Output,
}

impl KernelType {
    /// Numeric tag used to build exchange message ids
    pub fn type_id(&self) -> u32 {
        match self {
            KernelType::TableScan => 1,
            KernelType::BindableTableScan => 2,
            KernelType::Projection => 3,
            KernelType::Filter => 4,
            KernelType::Print => 5,
            KernelType::Output => 6,
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelType::TableScan => write!(f, "TableScan"),
            KernelType::BindableTableScan => write!(f, "BindableTableScan"),
            KernelType::Projection => write!(f, "Projection"),
            KernelType::Filter => write!(f, "Filter"),
            KernelType::Print => write!(f, "Print"),
            KernelType::Output => write!(f, "OutputKernel"),
        }
    }
}

/// State shared by every kernel implementation
pub struct KernelBase {
    id: KernelId,
    kernel_type: KernelType,
    /// Opaque to the kernel; handed to the compute engine
    expression: String,
    context: Arc<Context>,
    inputs: RwLock<HashMap<String, Arc<CacheMachine>>>,
    output: RwLock<Option<Arc<CacheMachine>>>,
    state: AtomicU8,
    /// High-water mark of published row estimates
    estimate_hwm: AtomicU64,
    estimate_known: AtomicBool,
}

impl KernelBase {
    pub fn new(kernel_type: KernelType, expression: impl Into<String>, context: Arc<Context>) -> Self {
        Self {
            id: NEXT_KERNEL_ID.fetch_add(1, Ordering::Relaxed),
            kernel_type,
            expression: expression.into(),
            context,
            inputs: RwLock::new(HashMap::new()),
            output: RwLock::new(None),
            state: AtomicU8::new(KernelState::Created as u8),
            estimate_hwm: AtomicU64::new(0),
            estimate_known: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn kernel_type(&self) -> KernelType {
        self.kernel_type
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Channel id for data this kernel receives from remote nodes
    pub fn message_id(&self) -> String {
        format!("{}_{}", self.kernel_type.type_id(), self.id)
    }

    pub fn state(&self) -> KernelState {
        KernelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: KernelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_input_cache(&self, port: impl Into<String>, cache: Arc<CacheMachine>) {
        self.inputs.write().insert(port.into(), cache);
    }

    /// Input cache on the default port
    pub fn input_cache(&self) -> Result<Arc<CacheMachine>> {
        self.input_cache_on(DEFAULT_PORT)
    }

    pub fn input_cache_on(&self, port: &str) -> Result<Arc<CacheMachine>> {
        self.inputs.read().get(port).cloned().ok_or_else(|| {
            QueryError::PortNotConnected(format!(
                "{} kernel {} has no input on port '{}'",
                self.kernel_type, self.id, port
            ))
        })
    }

    pub fn input_caches(&self) -> Vec<Arc<CacheMachine>> {
        self.inputs.read().values().cloned().collect()
    }

    pub fn set_output_cache(&self, cache: Arc<CacheMachine>) {
        *self.output.write() = Some(cache);
    }

    pub fn output_cache(&self) -> Option<Arc<CacheMachine>> {
        self.output.read().clone()
    }

    fn require_output(&self) -> Result<Arc<CacheMachine>> {
        self.output_cache().ok_or_else(|| {
            QueryError::PortNotConnected(format!(
                "{} kernel {} has no output cache",
                self.kernel_type, self.id
            ))
        })
    }

    /// Push a produced batch downstream
    pub fn add_to_output_cache(&self, batch: RecordBatch) -> Result<()> {
        self.require_output()?.add_batch(batch)
    }

    /// Push a raw unit downstream without touching its tier
    pub fn add_data_to_output_cache(&self, data: CacheData) -> Result<()> {
        self.require_output()?.add_to_cache(data)
    }

    /// Rows this kernel has pushed downstream
    pub fn rows_written(&self) -> u64 {
        self.output_cache()
            .map(|cache| cache.total_rows_added())
            .unwrap_or(0)
    }

    /// Rows that have arrived on the default input
    pub fn rows_read(&self) -> u64 {
        self.inputs
            .read()
            .get(DEFAULT_PORT)
            .map(|cache| cache.total_rows_added())
            .unwrap_or(0)
    }

    /// Scale the upstream estimate by the selectivity observed so far
    pub fn selectivity_estimate(&self, input_estimate: Option<u64>) -> Option<u64> {
        let total_in = input_estimate?;
        let in_so_far = self.rows_read();
        if in_so_far == 0 {
            return None;
        }
        let out_so_far = self.rows_written();
        Some((total_in as f64 * out_so_far as f64 / in_so_far as f64) as u64)
    }

    /// Publish an estimate through the high-water mark.
    ///
    /// Once an estimate has been known it never goes back to unknown and
    /// never decreases.
    pub fn monotonic_estimate(&self, estimate: Option<u64>) -> Option<u64> {
        match estimate {
            Some(rows) => {
                let prev = self.estimate_hwm.fetch_max(rows, Ordering::AcqRel);
                self.estimate_known.store(true, Ordering::Release);
                Some(prev.max(rows))
            }
            None if self.estimate_known.load(Ordering::Acquire) => {
                Some(self.estimate_hwm.load(Ordering::Acquire))
            }
            None => None,
        }
    }

    /// Drain `input`, transforming each batch and pushing the result downstream.
    ///
    /// A failing transform drops that batch only. Failing to read the input
    /// or to push downstream ends the run with an error.
    pub fn process_batches<F>(&self, input: &mut BatchSequence, mut transform: F) -> Result<usize>
    where
        F: FnMut(RecordBatch) -> Result<RecordBatch>,
    {
        let mut batch_count = 0;
        while input.wait_for_next() {
            let Some(batch) = input.next()? else {
                break;
            };
            match transform(batch) {
                Ok(output) => self.add_to_output_cache(output)?,
                Err(e) => self.log_batch_error(batch_count, &e),
            }
            batch_count += 1;
        }
        Ok(batch_count)
    }

    pub fn log_batch_error(&self, batch: usize, err: &QueryError) {
        error!(
            query_id = self.context.context_token(),
            step = self.context.query_step(),
            substep = self.context.query_substep(),
            kernel_id = self.id,
            batch,
            expression = %self.expression,
            "In {} kernel batch {}: {}",
            self.kernel_type,
            batch,
            err
        );
    }

    pub fn log_completed(&self, started: Instant) {
        debug!(
            query_id = self.context.context_token(),
            step = self.context.query_step(),
            substep = self.context.query_substep(),
            kernel_id = self.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "{} Kernel Completed",
            self.kernel_type
        );
    }
}

impl fmt::Debug for KernelBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBase")
            .field("id", &self.id)
            .field("type", &self.kernel_type)
            .field("state", &self.state())
            .field("inputs", &self.inputs.read().len())
            .field("has_output", &self.output.read().is_some())
            .finish()
    }
}

/// One operator of the execution graph
pub trait Kernel: Send + Sync {
    fn base(&self) -> &KernelBase;

    /// Drain the inputs to exhaustion
    fn run(&self) -> Result<KernelStatus>;

    /// Best-effort estimate of the rows this kernel will output in total.
    ///
    /// `input_estimate` is the graph's estimate of rows flowing into this
    /// kernel. `None` means unknown.
    fn estimated_output_num_rows(&self, input_estimate: Option<u64>) -> Option<u64> {
        let base = self.base();
        base.monotonic_estimate(base.selectivity_estimate(input_estimate))
    }

    fn id(&self) -> KernelId {
        self.base().id()
    }

    fn kernel_type(&self) -> KernelType {
        self.base().kernel_type()
    }
}
