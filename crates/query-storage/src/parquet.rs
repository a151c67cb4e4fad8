//! Parquet data source
//!
//! Every file is one handle. Row-group ids come from the file metadata, so a
//! scan produces one batch per row group; projections are pushed into the
//! reader.

use crate::provider::FileListProvider;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use query_core::{QueryError, Result};
use query_executor::{DataHandle, DataLoader, DataParser, TableSchema};
use std::fs::File;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct ParquetDataSource {
    schema: SchemaRef,
    files: Vec<(String, usize)>,
}

impl ParquetDataSource {
    /// Read the footers of `paths`; the first file defines the schema
    pub fn open<S: AsRef<str>>(paths: &[S]) -> Result<Self> {
        let mut schema = None;
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
            let row_groups = builder.metadata().num_row_groups();
            debug!("Parquet file '{}' has {} row groups", path, row_groups);
            schema.get_or_insert_with(|| Arc::clone(builder.schema()));
            files.push((path.to_string(), row_groups));
        }
        let schema = schema.ok_or_else(|| {
            QueryError::InvalidConfig("a Parquet table needs at least one file".to_string())
        })?;
        Ok(Self { schema, files })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Every file with all of its row groups selected
    pub fn table_schema(&self) -> TableSchema {
        self.files
            .iter()
            .fold(TableSchema::new(Arc::clone(&self.schema)), |table, (path, n)| {
                table.with_file(path.as_str(), (0..*n).collect())
            })
    }

    pub fn loader(self: Arc<Self>) -> DataLoader {
        let paths: Vec<&str> = self.files.iter().map(|(path, _)| path.as_str()).collect();
        let provider = FileListProvider::new(&paths);
        DataLoader::new(Box::new(provider), self)
    }
}

impl DataParser for ParquetDataSource {
    fn parse_batch(
        &self,
        handle: &DataHandle,
        schema: &TableSchema,
        projections: &[usize],
        row_groups: &[usize],
    ) -> Result<RecordBatch> {
        schema.projected_schema(projections)?;

        let mut builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&handle.uri)?)?;
        if !row_groups.is_empty() {
            builder = builder.with_row_groups(row_groups.to_vec());
        }

        // The mask keeps file order; restore the requested order afterwards
        let mut sorted = projections.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if !sorted.is_empty() {
            let mask = ProjectionMask::roots(builder.parquet_schema(), sorted.iter().copied());
            builder = builder.with_projection(mask);
        }

        let reader = builder.build()?;
        let read_schema = reader.schema();
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        let batch = concat_batches(&read_schema, &batches)?;

        if sorted.is_empty() {
            return Ok(batch);
        }
        let positions: Vec<usize> = projections
            .iter()
            .filter_map(|p| sorted.binary_search(p).ok())
            .collect();
        Ok(batch.project(&positions)?)
    }
}
