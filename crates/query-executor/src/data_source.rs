//! Data source contracts
//!
//! A scan reads through a [`DataLoader`]: a [`DataProvider`] hands out one
//! handle per file in schema order and a [`DataParser`] turns a handle plus
//! a row-group selection into a batch.

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use query_core::{Context, QueryError, Result};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::trace;

/// Reference to one file of a table. Empty for generated sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataHandle {
    pub uri: String,
}

impl DataHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.uri.is_empty()
    }
}

/// Hands out file handles in the order of [`TableSchema::files`]
pub trait DataProvider: Debug + Send {
    fn has_next(&mut self) -> bool;
    fn get_next(&mut self) -> Result<DataHandle>;
    /// Start over from the first file
    fn reset(&mut self);
}

/// Decodes one unit of a table
pub trait DataParser: Debug + Send + Sync {
    /// Logical partition count for sources without files
    fn num_partitions(&self) -> usize {
        0
    }

    /// Read `row_groups` of the file behind `handle`, keeping `projections`.
    ///
    /// Empty `projections` keeps every column; empty `row_groups` reads the
    /// whole file. For sources without files `handle` is empty and
    /// `row_groups` holds the partition index.
    fn parse_batch(
        &self,
        handle: &DataHandle,
        schema: &TableSchema,
        projections: &[usize],
        row_groups: &[usize],
    ) -> Result<RecordBatch>;
}

/// Provider and parser for one table
#[derive(Debug)]
pub struct DataLoader {
    provider: Box<dyn DataProvider>,
    parser: Arc<dyn DataParser>,
}

impl DataLoader {
    pub fn new(provider: Box<dyn DataProvider>, parser: Arc<dyn DataParser>) -> Self {
        Self { provider, parser }
    }

    pub fn provider_mut(&mut self) -> &mut dyn DataProvider {
        self.provider.as_mut()
    }

    pub fn parser(&self) -> &Arc<dyn DataParser> {
        &self.parser
    }

    pub fn load_batch(
        &self,
        context: &Context,
        projections: &[usize],
        schema: &TableSchema,
        handle: &DataHandle,
        file_index: usize,
        row_groups: &[usize],
    ) -> Result<RecordBatch> {
        trace!(
            query_id = context.context_token(),
            "Loading file {} row groups {:?} from '{}'",
            file_index,
            row_groups,
            handle.uri
        );
        self.parser
            .parse_batch(handle, schema, projections, row_groups)
    }
}

/// Table layout: columns, files and the row groups selected per file
#[derive(Debug, Clone)]
pub struct TableSchema {
    schema: SchemaRef,
    files: Vec<String>,
    row_groups: Vec<Vec<usize>>,
}

impl TableSchema {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            files: Vec::new(),
            row_groups: Vec::new(),
        }
    }

    /// Add a file; empty `row_groups` means the file is read whole
    pub fn with_file(mut self, path: impl Into<String>, row_groups: Vec<usize>) -> Self {
        self.files.push(path.into());
        self.row_groups.push(row_groups);
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn rowgroup_ids(&self, file_index: usize) -> &[usize] {
        self.row_groups
            .get(file_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Schema after applying `projections`; empty keeps every column
    pub fn projected_schema(&self, projections: &[usize]) -> Result<SchemaRef> {
        if projections.is_empty() {
            return Ok(Arc::clone(&self.schema));
        }
        let num_fields = self.schema.fields().len();
        if let Some(bad) = projections.iter().find(|&&i| i >= num_fields) {
            return Err(QueryError::ExecutionError(format!(
                "Projection index {} out of bounds for {} columns",
                bad, num_fields
            )));
        }
        Ok(Arc::new(Schema::new(
            projections
                .iter()
                .map(|&i| self.schema.field(i).clone())
                .collect::<Vec<_>>(),
        )))
    }

    /// Zero-row batch with the projected columns
    pub fn make_empty_batch(&self, projections: &[usize]) -> Result<RecordBatch> {
        Ok(RecordBatch::new_empty(self.projected_schema(projections)?))
    }
}
