//! Concrete kernels
//!
//! Sources (`TableScan`, `BindableTableScan`) read through a
//! [`DataSourceSequence`], transforms (`Projection`, `Filter`) delegate to a
//! [`ComputeEngine`], sinks (`Print`, `OutputKernel`) end the pipeline.

use crate::compute::ComputeEngine;
use crate::data_source::{DataLoader, TableSchema};
use crate::expression::{fix_column_aliases, get_projections, is_filtered_bindable_scan};
use crate::kernel::{Kernel, KernelBase, KernelStatus, KernelType};
use crate::sequence::{BatchProgress, BatchSequence, DataSourceSequence};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use parking_lot::Mutex;
use query_core::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

/// Read every unit of `input`, pushing the transformed batches downstream.
///
/// Read and transform failures drop the unit; push failures end the scan.
fn drain_source<F>(base: &KernelBase, input: &mut DataSourceSequence, mut transform: F) -> Result<usize>
where
    F: FnMut(RecordBatch) -> Result<RecordBatch>,
{
    let mut batch_count = 0;
    while input.wait_for_next() {
        match input.next().and_then(|unit| unit.map(|u| transform(u.batch)).transpose()) {
            Ok(Some(batch)) => base.add_to_output_cache(batch)?,
            Ok(None) => break,
            Err(e) => base.log_batch_error(batch_count, &e),
        }
        batch_count += 1;
    }
    Ok(batch_count)
}

fn scan_estimate(base: &KernelBase, progress: &BatchProgress) -> Option<u64> {
    base.monotonic_estimate(progress.extrapolate(base.rows_written()))
}

/// Rename the columns of `batch`; extra names are ignored
pub fn rename_columns(batch: RecordBatch, names: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let fields: Vec<_> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| match names.get(i) {
            Some(name) => field.as_ref().clone().with_name(name.as_str()),
            None => field.as_ref().clone(),
        })
        .collect();
    let renamed = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok(RecordBatch::try_new(renamed, batch.columns().to_vec())?)
}

/// Forwards every batch of a table unchanged
#[derive(Debug)]
pub struct TableScan {
    base: KernelBase,
    input: Mutex<DataSourceSequence>,
    progress: Arc<BatchProgress>,
}

impl TableScan {
    pub fn new(
        expression: impl Into<String>,
        loader: DataLoader,
        schema: TableSchema,
        context: Arc<Context>,
    ) -> Self {
        let input = DataSourceSequence::new(loader, schema, Arc::clone(&context));
        Self::from_sequence(expression, input, context)
    }

    pub fn from_sequence(
        expression: impl Into<String>,
        input: DataSourceSequence,
        context: Arc<Context>,
    ) -> Self {
        let progress = input.progress();
        Self {
            base: KernelBase::new(KernelType::TableScan, expression, context),
            input: Mutex::new(input),
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<BatchProgress> {
        &self.progress
    }
}

impl Kernel for TableScan {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let mut input = self.input.lock();
        drain_source(&self.base, &mut input, Ok)?;
        self.base.log_completed(started);
        Ok(KernelStatus::Proceed)
    }

    fn estimated_output_num_rows(&self, _input_estimate: Option<u64>) -> Option<u64> {
        scan_estimate(&self.base, &self.progress)
    }
}

/// Scan with pushed-down projection, filter and column aliases
#[derive(Debug)]
pub struct BindableTableScan {
    base: KernelBase,
    input: Mutex<DataSourceSequence>,
    progress: Arc<BatchProgress>,
    engine: Arc<dyn ComputeEngine>,
}

impl BindableTableScan {
    pub fn new(
        expression: impl Into<String>,
        loader: DataLoader,
        schema: TableSchema,
        context: Arc<Context>,
        engine: Arc<dyn ComputeEngine>,
    ) -> Result<Self> {
        let base = KernelBase::new(KernelType::BindableTableScan, expression, Arc::clone(&context));
        let mut input = DataSourceSequence::new(loader, schema, context);
        input.set_projections(get_projections(base.expression())?);
        let progress = input.progress();
        Ok(Self {
            base,
            input: Mutex::new(input),
            progress,
            engine,
        })
    }

    fn transform(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let expression = self.base.expression();
        let batch = if is_filtered_bindable_scan(expression) {
            self.engine
                .apply_filter(&batch, expression, self.base.context())?
        } else {
            batch
        };
        let names: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        rename_columns(batch, &fix_column_aliases(&names, expression))
    }
}

impl Kernel for BindableTableScan {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let mut input = self.input.lock();
        drain_source(&self.base, &mut input, |batch| self.transform(batch))?;
        self.base.log_completed(started);
        Ok(KernelStatus::Proceed)
    }

    fn estimated_output_num_rows(&self, _input_estimate: Option<u64>) -> Option<u64> {
        scan_estimate(&self.base, &self.progress)
    }
}

/// Evaluates the named output expressions over every batch
#[derive(Debug)]
pub struct Projection {
    base: KernelBase,
    engine: Arc<dyn ComputeEngine>,
}

impl Projection {
    pub fn new(
        expression: impl Into<String>,
        context: Arc<Context>,
        engine: Arc<dyn ComputeEngine>,
    ) -> Self {
        Self {
            base: KernelBase::new(KernelType::Projection, expression, context),
            engine,
        }
    }
}

impl Kernel for Projection {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let mut input = BatchSequence::new(self.base.input_cache()?);
        self.base.process_batches(&mut input, |batch| {
            self.engine
                .apply_projection(batch, self.base.expression(), self.base.context())
        })?;
        self.base.log_completed(started);
        Ok(KernelStatus::Proceed)
    }
}

#[derive(Debug)]
pub struct Filter {
    base: KernelBase,
    engine: Arc<dyn ComputeEngine>,
}

impl Filter {
    pub fn new(
        expression: impl Into<String>,
        context: Arc<Context>,
        engine: Arc<dyn ComputeEngine>,
    ) -> Self {
        Self {
            base: KernelBase::new(KernelType::Filter, expression, context),
            engine,
        }
    }
}

impl Kernel for Filter {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let mut input = BatchSequence::new(self.base.input_cache()?);
        self.base.process_batches(&mut input, |batch| {
            self.engine
                .apply_filter(&batch, self.base.expression(), self.base.context())
        })?;
        self.base.log_completed(started);
        Ok(KernelStatus::Proceed)
    }
}

/// Text sink shared between print kernels
pub type PrintSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes every batch as a table; kernels sharing a sink never interleave
pub struct Print {
    base: KernelBase,
    sink: PrintSink,
}

impl Print {
    /// Print to standard output
    pub fn new(context: Arc<Context>) -> Self {
        Self::with_sink(context, Arc::new(Mutex::new(Box::new(std::io::stdout()))))
    }

    pub fn with_sink(context: Arc<Context>, sink: PrintSink) -> Self {
        Self {
            base: KernelBase::new(KernelType::Print, "Print", context),
            sink,
        }
    }

    pub fn sink(&self) -> PrintSink {
        Arc::clone(&self.sink)
    }
}

impl Kernel for Print {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let mut input = BatchSequence::new(self.base.input_cache()?);
        let mut out = self.sink.lock();
        while input.wait_for_next() {
            let Some(batch) = input.next()? else {
                break;
            };
            writeln!(out, "{}", pretty_format_batches(&[batch])?)?;
        }
        out.flush()?;
        self.base.log_completed(started);
        Ok(KernelStatus::Stop)
    }

    fn estimated_output_num_rows(&self, _input_estimate: Option<u64>) -> Option<u64> {
        None
    }
}

impl std::fmt::Debug for Print {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Print").field("base", &self.base).finish()
    }
}

/// Holds the single final batch of a query until it is released
#[derive(Debug)]
pub struct OutputKernel {
    base: KernelBase,
    result: Mutex<Option<RecordBatch>>,
}

impl OutputKernel {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            base: KernelBase::new(KernelType::Output, "OutputKernel", context),
            result: Mutex::new(None),
        }
    }

    /// Take the result; later calls return `None`
    pub fn release(&self) -> Option<RecordBatch> {
        self.result.lock().take()
    }
}

impl Kernel for OutputKernel {
    fn base(&self) -> &KernelBase {
        &self.base
    }

    fn run(&self) -> Result<KernelStatus> {
        let started = Instant::now();
        let batch = self.base.input_cache()?.pull_from_cache()?;
        *self.result.lock() = batch;
        self.base.log_completed(started);
        Ok(KernelStatus::Stop)
    }

    fn estimated_output_num_rows(&self, _input_estimate: Option<u64>) -> Option<u64> {
        self.result.lock().as_ref().map(|batch| batch.num_rows() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::ArrowComputeEngine;
    use crate::kernel::DEFAULT_PORT;
    use crate::sequence::tests::{id_schema, three_file_sequence, ListProvider, RowGroupParser};
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field};
    use query_cache::CacheMachine;
    use query_core::QueryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_test_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn context() -> Arc<Context> {
        Arc::new(Context::local(7))
    }

    fn finished_cache(batches: Vec<RecordBatch>) -> Arc<CacheMachine> {
        let cache = Arc::new(CacheMachine::with_defaults("input"));
        for batch in batches {
            cache.add_batch(batch).unwrap();
        }
        cache.finish();
        cache
    }

    fn drain(cache: &CacheMachine) -> Vec<RecordBatch> {
        let mut out = Vec::new();
        while let Some(batch) = cache.pull_from_cache().unwrap() {
            out.push(batch);
        }
        out
    }

    /// Keeps the first `keep[i]` rows of the i-th batch; fails when `keep[i]` is None
    #[derive(Debug)]
    struct ScriptedEngine {
        keep: Vec<Option<usize>>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(keep: Vec<Option<usize>>) -> Arc<Self> {
            Arc::new(Self {
                keep,
                calls: AtomicUsize::new(0),
            })
        }

        fn step(&self, batch: &RecordBatch) -> Result<RecordBatch> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.keep.get(call).copied().flatten() {
                Some(rows) => Ok(batch.slice(0, rows)),
                None => Err(QueryError::ExpressionError(format!("batch {} rejected", call))),
            }
        }
    }

    impl ComputeEngine for ScriptedEngine {
        fn apply_filter(&self, batch: &RecordBatch, _: &str, _: &Context) -> Result<RecordBatch> {
            self.step(batch)
        }

        fn apply_projection(&self, batch: RecordBatch, _: &str, _: &Context) -> Result<RecordBatch> {
            self.step(&batch)
        }
    }

    fn hundred_rows() -> RecordBatch {
        create_test_batch((0..100).collect())
    }

    #[test]
    fn test_table_scan_forwards_every_batch() {
        let scan = TableScan::from_sequence("TableScan", three_file_sequence(&[]), context());
        let output = Arc::new(CacheMachine::with_defaults("scan-out"));
        scan.base().set_output_cache(Arc::clone(&output));

        assert_eq!(scan.estimated_output_num_rows(None), None);
        assert_eq!(scan.run().unwrap(), KernelStatus::Proceed);
        output.finish();

        assert_eq!(drain(&output).len(), 4);
        assert_eq!(scan.estimated_output_num_rows(None), Some(4));
    }

    #[test]
    fn test_table_scan_skips_unreadable_file() {
        let schema = TableSchema::new(id_schema())
            .with_file("a", vec![0])
            .with_file("b", vec![0]);
        let loader = DataLoader::new(
            Box::new(ListProvider::new(&["a", "b"])),
            Arc::new(RowGroupParser {
                partitions: 0,
                broken: vec!["a".to_string()],
            }),
        );
        let scan = TableScan::new("TableScan", loader, schema, context());
        let output = Arc::new(CacheMachine::with_defaults("scan-out"));
        scan.base().set_output_cache(Arc::clone(&output));

        assert_eq!(scan.run().unwrap(), KernelStatus::Proceed);
        assert_eq!(output.len(), 1);
        assert_eq!(scan.progress().batch_index(), 2);
    }

    #[test]
    fn test_bindable_scan_filters_and_renames() {
        let schema = TableSchema::new(Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ])))
        .with_file("f", vec![]);

        #[derive(Debug)]
        struct TwoColumnParser;
        impl crate::data_source::DataParser for TwoColumnParser {
            fn parse_batch(
                &self,
                _: &crate::data_source::DataHandle,
                schema: &TableSchema,
                projections: &[usize],
                _: &[usize],
            ) -> Result<RecordBatch> {
                let columns: Vec<arrow::array::ArrayRef> = vec![
                    Arc::new(Int64Array::from(vec![1, 2, 3])),
                    Arc::new(Int64Array::from(vec![10, 20, 30])),
                ];
                let picked = if projections.is_empty() {
                    columns
                } else {
                    projections.iter().map(|&i| columns[i].clone()).collect()
                };
                Ok(RecordBatch::try_new(schema.projected_schema(projections)?, picked)?)
            }
        }

        let loader = DataLoader::new(Box::new(ListProvider::new(&["f"])), Arc::new(TwoColumnParser));
        let scan = BindableTableScan::new(
            "BindableTableScan(table=[[main, t]], filters=[[>($0, 15)]], projects=[[1]], aliases=[[score]])",
            loader,
            schema,
            context(),
            Arc::new(ArrowComputeEngine::new()),
        )
        .unwrap();
        let output = Arc::new(CacheMachine::with_defaults("scan-out"));
        scan.base().set_output_cache(Arc::clone(&output));
        scan.run().unwrap();
        output.finish();

        let batches = drain(&output);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].schema().field(0).name(), "score");
        let values = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(values.values().to_vec(), vec![20, 30]);
    }

    #[test]
    fn test_transform_failure_drops_only_that_batch() {
        let engine = ScriptedEngine::new(vec![Some(1), None, Some(1)]);
        let projection = Projection::new("LogicalProject(id=[$0])", context(), engine);
        projection.base().set_input_cache(
            DEFAULT_PORT,
            finished_cache(vec![
                create_test_batch(vec![1]),
                create_test_batch(vec![2]),
                create_test_batch(vec![3]),
            ]),
        );
        let output = Arc::new(CacheMachine::with_defaults("proj-out"));
        projection.base().set_output_cache(Arc::clone(&output));

        assert_eq!(projection.run().unwrap(), KernelStatus::Proceed);
        output.finish();
        let ids: Vec<i64> = drain(&output)
            .iter()
            .map(|b| b.column(0).as_any().downcast_ref::<Int64Array>().unwrap().value(0))
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_filter_estimate_scales_by_selectivity() {
        let engine = ScriptedEngine::new(vec![Some(40), Some(60)]);
        let filter = Filter::new("LogicalFilter(condition=[>($0, 0)])", context(), engine);
        assert_eq!(filter.estimated_output_num_rows(Some(1000)), None);
        filter
            .base()
            .set_input_cache(DEFAULT_PORT, finished_cache(vec![hundred_rows(), hundred_rows()]));
        let output = Arc::new(CacheMachine::with_defaults("filter-out"));
        filter.base().set_output_cache(Arc::clone(&output));

        filter.run().unwrap();
        assert_eq!(filter.estimated_output_num_rows(Some(1000)), Some(500));
        assert_eq!(filter.base().rows_written(), 100);
    }

    #[test]
    fn test_print_writes_tables_and_stops() {
        let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink: PrintSink = Arc::new(Mutex::new(Box::new(Shared(Arc::clone(&buffer)))));
        let print = Print::with_sink(context(), sink);
        print
            .base()
            .set_input_cache(DEFAULT_PORT, finished_cache(vec![create_test_batch(vec![42])]));

        assert_eq!(print.run().unwrap(), KernelStatus::Stop);
        let text = String::from_utf8(buffer.lock().clone()).unwrap();
        assert!(text.contains("| id |"));
        assert!(text.contains("| 42 |"));
    }

    #[test]
    fn test_output_kernel_releases_one_batch() {
        let output = OutputKernel::new(context());
        output.base().set_input_cache(
            DEFAULT_PORT,
            finished_cache(vec![create_test_batch(vec![1, 2]), create_test_batch(vec![3])]),
        );

        assert_eq!(output.run().unwrap(), KernelStatus::Stop);
        assert_eq!(output.estimated_output_num_rows(None), Some(2));
        let batch = output.release().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert!(output.release().is_none());
    }

    #[test]
    fn test_unconnected_transform_fails() {
        let filter = Filter::new("LogicalFilter(condition=[true])", context(), Arc::new(ArrowComputeEngine));
        assert!(matches!(filter.run(), Err(QueryError::PortNotConnected(_))));
    }

    #[test]
    fn test_rename_columns() {
        let batch = create_test_batch(vec![1]);
        let renamed = rename_columns(batch, &["key".to_string(), "extra".to_string()]).unwrap();
        assert_eq!(renamed.schema().field(0).name(), "key");
        assert_eq!(renamed.num_columns(), 1);
    }
}
