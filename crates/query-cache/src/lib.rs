//! Cache machines for the batch pipeline
//!
//! Kernels never call each other; every edge of an execution graph is a
//! [`CacheMachine`] that the producer pushes into and the consumer pulls from.
//!
//! # Features
//!
//! - **FIFO**: Entries come out in the order they went in
//! - **Backpressure**: Optional bound on queued batches blocks the producer
//! - **Tiering**: Batches demote to IPC bytes in host memory, then spill to disk
//! - **Bypass mode**: Relaying consumers take raw entries without decoding them
//! - **Host caches**: Landing zone for batches received from remote nodes
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{CacheConfig, CacheMachine};
//!
//! let cache = CacheMachine::new("scan->filter", CacheConfig::bounded(8));
//! cache.add_batch(batch)?;
//! cache.finish();
//!
//! while let Some(batch) = cache.pull_from_cache()? {
//!     process(batch);
//! }
//! ```

pub mod cache;
pub mod config;
pub mod data;
pub mod host_table;
pub mod spill;
pub mod stats;

pub use cache::{CacheMachine, HostCacheMachine};
pub use config::{CacheConfig, ConsumptionMode};
pub use data::{batch_size_bytes, CacheData, CacheDataKind};
pub use host_table::HostTable;
pub use spill::SpillFile;
pub use stats::CacheStats;
