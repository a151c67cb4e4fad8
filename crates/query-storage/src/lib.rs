pub mod csv;
pub mod memory;
pub mod parquet;
pub mod provider;

pub use csv::CsvDataSource;
pub use memory::MemoryDataSource;
pub use parquet::ParquetDataSource;
pub use provider::FileListProvider;
