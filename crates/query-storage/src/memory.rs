//! In-memory data source
//!
//! Holds its rows as logical partitions instead of files. Scans over it run
//! in partition mode: one batch per partition, and a single empty batch when
//! there are no partitions at all.

use crate::provider::FileListProvider;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result};
use query_executor::{DataHandle, DataLoader, DataParser, TableSchema};
use std::sync::Arc;

#[derive(Debug)]
pub struct MemoryDataSource {
    schema: SchemaRef,
    partitions: Vec<RecordBatch>,
}

impl MemoryDataSource {
    pub fn new(schema: SchemaRef, partitions: Vec<RecordBatch>) -> Result<Self> {
        for (index, batch) in partitions.iter().enumerate() {
            if batch.schema().fields() != schema.fields() {
                return Err(QueryError::ExecutionError(format!(
                    "partition {} does not match the table schema",
                    index
                )));
            }
        }
        Ok(Self { schema, partitions })
    }

    /// Table with no partitions
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            partitions: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.partitions.iter().map(|b| b.num_rows()).sum()
    }

    /// Add one partition
    pub fn append(&mut self, batch: RecordBatch) -> Result<()> {
        if batch.schema().fields() != self.schema.fields() {
            return Err(QueryError::ExecutionError(format!(
                "partition {} does not match the table schema",
                self.partitions.len()
            )));
        }
        self.partitions.push(batch);
        Ok(())
    }

    /// Layout without files, so scans use partition mode
    pub fn table_schema(&self) -> TableSchema {
        TableSchema::new(Arc::clone(&self.schema))
    }

    pub fn loader(self: Arc<Self>) -> DataLoader {
        DataLoader::new(Box::new(FileListProvider::default()), self)
    }
}

impl DataParser for MemoryDataSource {
    fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn parse_batch(
        &self,
        _handle: &DataHandle,
        _schema: &TableSchema,
        projections: &[usize],
        row_groups: &[usize],
    ) -> Result<RecordBatch> {
        let partition = row_groups
            .first()
            .and_then(|&index| self.partitions.get(index))
            .ok_or_else(|| {
                QueryError::ExecutionError(format!(
                    "no partition {:?} among {}",
                    row_groups,
                    self.partitions.len()
                ))
            })?;
        if projections.is_empty() {
            Ok(partition.clone())
        } else {
            Ok(partition.project(projections)?)
        }
    }
}
