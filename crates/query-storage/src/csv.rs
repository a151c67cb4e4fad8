//! CSV data source, one batch per file

use crate::provider::FileListProvider;
use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use query_core::{QueryError, Result};
use query_executor::{DataHandle, DataLoader, DataParser, TableSchema};
use std::fs::File;
use std::sync::Arc;

#[derive(Debug)]
pub struct CsvDataSource {
    schema: SchemaRef,
    files: Vec<String>,
    has_header: bool,
}

impl CsvDataSource {
    pub fn new<S: AsRef<str>>(schema: SchemaRef, paths: &[S]) -> Self {
        Self {
            schema,
            files: paths.iter().map(|p| p.as_ref().to_string()).collect(),
            has_header: true,
        }
    }

    /// Infer the schema from the first file
    pub fn infer<S: AsRef<str>>(paths: &[S]) -> Result<Self> {
        let first = paths.first().ok_or_else(|| {
            QueryError::InvalidConfig("a CSV table needs at least one file".to_string())
        })?;
        let file = File::open(first.as_ref())?;
        let (schema, _) = Format::default()
            .with_header(true)
            .infer_schema(file, Some(1000))?;
        Ok(Self::new(Arc::new(schema), paths))
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Every file read whole
    pub fn table_schema(&self) -> TableSchema {
        self.files
            .iter()
            .fold(TableSchema::new(Arc::clone(&self.schema)), |table, path| {
                table.with_file(path.as_str(), Vec::new())
            })
    }

    pub fn loader(self: Arc<Self>) -> DataLoader {
        let provider = FileListProvider::new(&self.files);
        DataLoader::new(Box::new(provider), self)
    }
}

impl DataParser for CsvDataSource {
    fn parse_batch(
        &self,
        handle: &DataHandle,
        schema: &TableSchema,
        projections: &[usize],
        _row_groups: &[usize],
    ) -> Result<RecordBatch> {
        let mut builder =
            ReaderBuilder::new(Arc::clone(schema.schema())).with_header(self.has_header);
        if !projections.is_empty() {
            builder = builder.with_projection(projections.to_vec());
        }

        let reader = builder.build(File::open(&handle.uri)?)?;
        let read_schema = reader.schema();
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(concat_batches(&read_schema, &batches)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use query_core::Context;
    use query_executor::DataSourceSequence;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_one_batch_per_file() {
        let dir = TempDir::new().unwrap();
        let a = write_csv(&dir, "a.csv", "id,score\n1,0.5\n2,1.5\n3,2.5\n");
        let b = write_csv(&dir, "b.csv", "id,score\n4,3.5\n");
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("score", DataType::Float64, true),
        ]));

        let source = Arc::new(CsvDataSource::new(schema, &[a, b]));
        let table = source.table_schema();
        let mut seq =
            DataSourceSequence::new(source.loader(), table, Arc::new(Context::local(1)));
        seq.set_projections(vec![1]);
        assert_eq!(seq.num_batches(), 2);

        let first = seq.next().unwrap().unwrap();
        assert_eq!(first.file_index, 0);
        assert_eq!(first.batch.num_rows(), 3);
        let scores = first
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(scores.value(2), 2.5);

        let second = seq.next().unwrap().unwrap();
        assert_eq!(second.file_index, 1);
        assert_eq!(second.batch.num_rows(), 1);
    }

    #[test]
    fn test_infer_schema() {
        let dir = TempDir::new().unwrap();
        let a = write_csv(&dir, "a.csv", "id,name\n1,alice\n2,bob\n");
        let source = Arc::new(CsvDataSource::infer(&[a.clone()]).unwrap());
        assert_eq!(source.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(source.schema().field(1).data_type(), &DataType::Utf8);

        let table = source.table_schema();
        let batch = source
            .parse_batch(&DataHandle::new(a), &table, &[], &[])
            .unwrap();
        let ids = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.value(1), 2);
    }

    #[test]
    fn test_malformed_row_fails() {
        let dir = TempDir::new().unwrap();
        let a = write_csv(&dir, "bad.csv", "id\nnot-a-number\n");
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let source = CsvDataSource::new(schema, &[a.clone()]);
        let table = source.table_schema();
        assert!(source
            .parse_batch(&DataHandle::new(a), &table, &[], &[])
            .is_err());
    }
}
