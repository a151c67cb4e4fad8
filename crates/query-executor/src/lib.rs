//! Kernel execution for the batch pipeline
//!
//! A query runs as an [`ExecutionGraph`] of kernels joined by cache
//! machines. Sources read through [`DataSourceSequence`] or receive remote
//! batches through [`ExternalBatchColumnDataSequence`].

pub mod compute;
pub mod config;
pub mod data_source;
pub mod expression;
pub mod external;
pub mod graph;
pub mod kernel;
pub mod operators;
pub mod sequence;

pub use compute::{ArrowComputeEngine, ComputeEngine};
pub use config::EngineConfig;
pub use data_source::{DataHandle, DataLoader, DataParser, DataProvider, TableSchema};
pub use external::ExternalBatchColumnDataSequence;
pub use graph::{Edge, ExecutionGraph};
pub use kernel::{Kernel, KernelBase, KernelId, KernelState, KernelStatus, KernelType, DEFAULT_PORT};
pub use operators::{
    BindableTableScan, Filter, OutputKernel, Print, PrintSink, Projection, TableScan,
};
pub use sequence::{
    BatchProgress, BatchSequence, BatchSequenceBypass, DataSourceSequence, SourceBatch,
};
