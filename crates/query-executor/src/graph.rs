//! Execution graph
//!
//! Kernels are wired together by cache machines and run one thread each.
//! The graph finishes a kernel's output cache when its `run` returns, so
//! end-of-stream always propagates downstream, also after a failure. When a
//! kernel stops reading early, its input caches discard whatever is pushed
//! afterwards so the producers can run to the end.

use crate::config::EngineConfig;
use crate::kernel::{Kernel, KernelId, KernelState, KernelStatus, DEFAULT_PORT};
use query_cache::{CacheConfig, CacheMachine, ConsumptionMode};
use query_core::{Context, QueryError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info};

/// One wired edge
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: KernelId,
    pub to: KernelId,
    pub port: String,
    pub cache: Arc<CacheMachine>,
}

pub struct ExecutionGraph {
    context: Arc<Context>,
    config: EngineConfig,
    kernels: Vec<Arc<dyn Kernel>>,
    index: HashMap<KernelId, usize>,
    edges: Vec<Edge>,
}

impl ExecutionGraph {
    pub fn new(context: Arc<Context>) -> Self {
        Self::with_config(context, EngineConfig::default())
    }

    pub fn with_config(context: Arc<Context>, config: EngineConfig) -> Self {
        Self {
            context,
            config,
            kernels: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_kernel(&mut self, kernel: Arc<dyn Kernel>) -> KernelId {
        let id = kernel.id();
        self.index.insert(id, self.kernels.len());
        self.kernels.push(kernel);
        id
    }

    pub fn kernel(&self, id: KernelId) -> Option<&Arc<dyn Kernel>> {
        self.index.get(&id).map(|&i| &self.kernels[i])
    }

    fn require(&self, id: KernelId) -> Result<&Arc<dyn Kernel>> {
        self.kernel(id)
            .ok_or_else(|| QueryError::ExecutionError(format!("kernel {} is not in the graph", id)))
    }

    pub fn kernels(&self) -> &[Arc<dyn Kernel>] {
        &self.kernels
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Wire `from`'s output into `to` on `port`.
    ///
    /// A producer has a single output cache. Only a bypass cache takes more
    /// than one consumer, and every consumer must ask for the same config;
    /// each entry then goes to exactly one of them.
    pub fn connect(
        &mut self,
        from: KernelId,
        to: KernelId,
        port: &str,
        config: CacheConfig,
    ) -> Result<Arc<CacheMachine>> {
        let producer = self.require(from)?;
        let consumer = self.require(to)?;

        let cache = match producer.base().output_cache() {
            Some(cache) => {
                if cache.mode() != ConsumptionMode::Bypass || config.mode != ConsumptionMode::Bypass
                {
                    return Err(QueryError::CacheModeError(format!(
                        "cache '{}' already has a reader; only bypass caches take several",
                        cache.name()
                    )));
                }
                if cache.config() != &config {
                    return Err(QueryError::InvalidConfig(format!(
                        "cache '{}' was created with a different config",
                        cache.name()
                    )));
                }
                cache
            }
            None => {
                let name = format!(
                    "{}#{}->{}#{}",
                    producer.kernel_type(),
                    from,
                    consumer.kernel_type(),
                    to
                );
                let cache = Arc::new(CacheMachine::new(name, config));
                producer.base().set_output_cache(Arc::clone(&cache));
                cache
            }
        };
        consumer.base().set_input_cache(port, Arc::clone(&cache));

        self.edges.push(Edge {
            from,
            to,
            port: port.to_string(),
            cache: Arc::clone(&cache),
        });
        Ok(cache)
    }

    /// Wire on the default port with the engine's cache settings
    pub fn connect_default(&mut self, from: KernelId, to: KernelId) -> Result<Arc<CacheMachine>> {
        let config = self.config.cache.clone();
        self.connect(from, to, DEFAULT_PORT, config)
    }

    /// Run every kernel on its own thread and wait for all of them.
    ///
    /// Returns the status of each kernel, or the first error raised by one.
    pub fn execute(&self) -> Result<HashMap<KernelId, KernelStatus>> {
        let started = Instant::now();
        let mut handles = Vec::with_capacity(self.kernels.len());

        for kernel in &self.kernels {
            let kernel = Arc::clone(kernel);
            let id = kernel.id();
            let own_inputs = self.sole_reader_inputs(id);
            let handle = thread::Builder::new()
                .name(format!("kernel-{}-{}", kernel.kernel_type(), id))
                .spawn(move || run_kernel(kernel.as_ref(), &own_inputs))?;
            handles.push((id, handle));
        }

        let mut statuses = HashMap::new();
        let mut first_error = None;
        for (id, handle) in handles {
            match handle.join() {
                Ok(Ok(status)) => {
                    statuses.insert(id, status);
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(QueryError::ExecutionError(format!(
                        "kernel {} panicked",
                        id
                    )));
                }
            }
        }

        info!(
            query_id = self.context.context_token(),
            step = self.context.query_step(),
            substep = self.context.query_substep(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Execution graph with {} kernels completed",
            self.kernels.len()
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(statuses),
        }
    }

    /// Input caches that `id` is the only reader of
    fn sole_reader_inputs(&self, id: KernelId) -> Vec<Arc<CacheMachine>> {
        self.edges
            .iter()
            .filter(|edge| edge.to == id)
            .filter(|edge| {
                !self
                    .edges
                    .iter()
                    .any(|other| other.to != id && Arc::ptr_eq(&other.cache, &edge.cache))
            })
            .map(|edge| Arc::clone(&edge.cache))
            .collect()
    }

    /// Abort every edge, waking all blocked kernels
    pub fn cancel(&self) {
        for edge in &self.edges {
            edge.cache.cancel();
        }
    }

    /// Sum of the producers' estimates; unknown if any producer is unknown
    pub fn estimated_input_rows_to_kernel(&self, id: KernelId) -> Option<u64> {
        let mut producers: Vec<KernelId> = self
            .edges
            .iter()
            .filter(|edge| edge.to == id)
            .map(|edge| edge.from)
            .collect();
        if producers.is_empty() {
            return None;
        }
        producers.dedup();

        let mut total = 0u64;
        for producer in producers {
            total = total.checked_add(self.estimated_output_num_rows(producer)?)?;
        }
        Some(total)
    }

    pub fn estimated_output_num_rows(&self, id: KernelId) -> Option<u64> {
        let kernel = self.kernel(id)?;
        kernel.estimated_output_num_rows(self.estimated_input_rows_to_kernel(id))
    }
}

fn run_kernel(kernel: &dyn Kernel, own_inputs: &[Arc<CacheMachine>]) -> Result<KernelStatus> {
    let base = kernel.base();
    base.set_state(KernelState::Running);
    let result = kernel.run();

    if let Some(output) = base.output_cache() {
        output.finish();
    }
    match &result {
        Ok(status) => {
            if *status == KernelStatus::Stop {
                for input in own_inputs {
                    input.discard();
                }
            }
            base.set_state((*status).into())
        }
        Err(e) => {
            error!(
                query_id = base.context().context_token(),
                kernel_id = base.id(),
                expression = %base.expression(),
                "{} kernel failed: {}",
                base.kernel_type(),
                e
            );
            // Unblock producers still pushing into this kernel
            for input in base.input_caches() {
                input.cancel();
            }
            base.set_state(KernelState::Stop);
        }
    }
    result
}

impl std::fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("context", &self.context.to_string())
            .field("kernels", &self.kernels.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ArrowComputeEngine, ComputeEngine};
    use crate::kernel::KernelBase;
    use crate::operators::{Filter, OutputKernel, Print, PrintSink, Projection, TableScan};
    use crate::sequence::tests::three_file_sequence;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    fn context() -> Arc<Context> {
        Arc::new(Context::local(3))
    }

    fn engine() -> Arc<dyn ComputeEngine> {
        Arc::new(ArrowComputeEngine::new())
    }

    /// Source kernel pushing a fixed list of batches
    struct BatchSource {
        base: KernelBase,
        batches: Mutex<Vec<RecordBatch>>,
    }

    impl BatchSource {
        fn new(batches: Vec<RecordBatch>) -> Arc<Self> {
            Arc::new(Self {
                base: KernelBase::new(crate::kernel::KernelType::TableScan, "source", context()),
                batches: Mutex::new(batches),
            })
        }
    }

    impl Kernel for BatchSource {
        fn base(&self) -> &KernelBase {
            &self.base
        }

        fn run(&self) -> Result<KernelStatus> {
            for batch in self.batches.lock().drain(..) {
                self.base.add_to_output_cache(batch)?;
            }
            Ok(KernelStatus::Proceed)
        }

        fn estimated_output_num_rows(&self, _: Option<u64>) -> Option<u64> {
            Some(1000)
        }
    }

    fn create_test_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[test]
    fn test_scan_filter_project_output() {
        let mut graph = ExecutionGraph::new(context());
        let source = BatchSource::new(vec![
            create_test_batch(vec![1, 2, 3]),
            create_test_batch(vec![4, 5, 6]),
        ]);
        let filter = Arc::new(Filter::new(
            "LogicalFilter(condition=[>($0, 4)])",
            context(),
            engine(),
        ));
        let project = Arc::new(Projection::new(
            "LogicalProject(id=[$0], next=[+($0, 1)])",
            context(),
            engine(),
        ));
        let output = Arc::new(OutputKernel::new(context()));

        let s = graph.add_kernel(source);
        let f = graph.add_kernel(filter.clone());
        let p = graph.add_kernel(project);
        let o = graph.add_kernel(output.clone());
        graph.connect_default(s, f).unwrap();
        graph.connect_default(f, p).unwrap();
        graph.connect(p, o, DEFAULT_PORT, CacheConfig::bounded(4)).unwrap();

        let statuses = graph.execute().unwrap();
        assert_eq!(statuses[&s], KernelStatus::Proceed);
        assert_eq!(statuses[&o], KernelStatus::Stop);
        assert_eq!(filter.base().state(), KernelState::Proceed);

        // First batch is filtered down to zero rows but still forwarded.
        let first = output.release().unwrap();
        assert_eq!(first.num_rows(), 0);
        assert_eq!(first.schema().field(1).name(), "next");

        // 1000 upstream rows at 2/6 selectivity
        assert_eq!(graph.estimated_input_rows_to_kernel(f), Some(1000));
        assert_eq!(graph.estimated_output_num_rows(f), Some(333));
        assert_eq!(graph.estimated_input_rows_to_kernel(s), None);
    }

    #[test]
    fn test_second_reader_rejected_on_materialize_cache() {
        let mut graph = ExecutionGraph::new(context());
        let s = graph.add_kernel(BatchSource::new(Vec::new()));
        let a = graph.add_kernel(Arc::new(OutputKernel::new(context())));
        let b = graph.add_kernel(Arc::new(OutputKernel::new(context())));

        graph.connect_default(s, a).unwrap();
        let err = graph.connect_default(s, b).unwrap_err();
        assert!(matches!(err, QueryError::CacheModeError(_)));
        let err = graph
            .connect(s, b, DEFAULT_PORT, CacheConfig::bypass())
            .unwrap_err();
        assert!(matches!(err, QueryError::CacheModeError(_)));
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_bypass_fan_out_shares_one_cache() {
        let mut graph = ExecutionGraph::new(context());
        let s = graph.add_kernel(BatchSource::new(Vec::new()));
        let a = graph.add_kernel(Arc::new(OutputKernel::new(context())));
        let b = graph.add_kernel(Arc::new(OutputKernel::new(context())));
        let c = graph.add_kernel(Arc::new(OutputKernel::new(context())));

        let first = graph.connect(s, a, DEFAULT_PORT, CacheConfig::bypass()).unwrap();
        let second = graph.connect(s, b, DEFAULT_PORT, CacheConfig::bypass()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.mode(), ConsumptionMode::Bypass);
        assert_eq!(graph.estimated_input_rows_to_kernel(b), Some(1000));

        let err = graph
            .connect(s, c, DEFAULT_PORT, CacheConfig::bypass().with_max_batches(2))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfig(_)));
        assert!(graph.sole_reader_inputs(a).is_empty());
    }

    #[test]
    fn test_early_stop_on_bounded_edge_lets_producer_finish() {
        let mut graph = ExecutionGraph::new(context());
        let batches = (0..10).map(|i| create_test_batch(vec![i])).collect();
        let s = graph.add_kernel(BatchSource::new(batches));
        let output = Arc::new(OutputKernel::new(context()));
        let o = graph.add_kernel(output.clone());
        let cache = graph.connect(s, o, DEFAULT_PORT, CacheConfig::bounded(2)).unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(graph.execute());
        });
        let statuses = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("execute did not return")
            .unwrap();

        assert_eq!(statuses[&s], KernelStatus::Proceed);
        assert_eq!(statuses[&o], KernelStatus::Stop);
        assert_eq!(output.release().unwrap().num_rows(), 1);
        assert!(cache.is_discarding());
        assert!(!cache.is_cancelled());
        assert_eq!(cache.total_rows_added(), 10);
    }

    #[test]
    fn test_unknown_kernel() {
        let mut graph = ExecutionGraph::new(context());
        let s = graph.add_kernel(BatchSource::new(Vec::new()));
        assert!(graph.connect_default(s, 999_999).is_err());
        assert!(graph.estimated_output_num_rows(999_999).is_none());
    }

    #[test]
    fn test_failed_kernel_still_finishes_its_output() {
        let mut graph = ExecutionGraph::new(context());
        let scan = Arc::new(TableScan::from_sequence("TableScan", three_file_sequence(&[]), context()));
        // Not connected: every push fails
        let lonely = graph.add_kernel(scan);
        let printer_sink: PrintSink = Arc::new(Mutex::new(Box::new(std::io::sink())));
        let print = Arc::new(Print::with_sink(context(), printer_sink));
        let p = graph.add_kernel(print.clone());
        let feeder = graph.add_kernel(BatchSource::new(vec![create_test_batch(vec![1])]));
        graph.connect_default(feeder, p).unwrap();

        let err = graph.execute().unwrap_err();
        assert!(matches!(err, QueryError::PortNotConnected(_)));
        assert_eq!(graph.kernel(lonely).unwrap().base().state(), KernelState::Stop);
        assert_eq!(print.base().state(), KernelState::Stop);
        assert!(graph.edges()[0].cache.is_finished());
    }

    #[test]
    fn test_cancel_wakes_blocked_kernels() {
        let mut graph = ExecutionGraph::new(context());
        let s = graph.add_kernel(BatchSource::new(Vec::new()));
        let o = graph.add_kernel(Arc::new(OutputKernel::new(context())));
        let cache = graph.connect_default(s, o).unwrap();

        graph.cancel();
        assert!(cache.is_cancelled());
        assert!(!cache.wait_for_next());
    }
}
