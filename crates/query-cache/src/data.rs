//! Units of data transported by cache machines

use crate::host_table::HostTable;
use crate::spill::SpillFile;
use arrow::record_batch::RecordBatch;
use query_core::Result;
use std::fmt;
use std::path::Path;

/// Where a unit of cache data currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheDataKind {
    /// Columnar batch in working memory
    Resident,
    /// IPC-encoded batch in host memory
    Host,
    /// IPC file on local disk
    Spilled,
}

impl fmt::Display for CacheDataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheDataKind::Resident => write!(f, "Resident"),
            CacheDataKind::Host => write!(f, "Host"),
            CacheDataKind::Spilled => write!(f, "Spilled"),
        }
    }
}

#[derive(Debug)]
enum Payload {
    Resident(RecordBatch),
    Host(HostTable),
    Spilled(SpillFile),
}

/// One batch worth of data plus its routing key.
///
/// Cache machines never look inside; ownership moves on every hand-off.
#[derive(Debug)]
pub struct CacheData {
    payload: Payload,
    partition_id: Option<u32>,
}

impl CacheData {
    pub fn resident(batch: RecordBatch) -> Self {
        Self {
            payload: Payload::Resident(batch),
            partition_id: None,
        }
    }

    pub fn host(table: HostTable) -> Self {
        let partition_id = table.partition_id();
        Self {
            payload: Payload::Host(table),
            partition_id,
        }
    }

    pub fn spilled(file: SpillFile) -> Self {
        Self {
            payload: Payload::Spilled(file),
            partition_id: None,
        }
    }

    pub fn with_partition_id(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        if let Payload::Host(table) = &mut self.payload {
            table.set_partition_id(partition_id);
        }
        self
    }

    pub fn kind(&self) -> CacheDataKind {
        match &self.payload {
            Payload::Resident(_) => CacheDataKind::Resident,
            Payload::Host(_) => CacheDataKind::Host,
            Payload::Spilled(_) => CacheDataKind::Spilled,
        }
    }

    pub fn partition_id(&self) -> Option<u32> {
        self.partition_id
    }

    pub fn num_rows(&self) -> usize {
        match &self.payload {
            Payload::Resident(batch) => batch.num_rows(),
            Payload::Host(table) => table.num_rows(),
            Payload::Spilled(file) => file.num_rows(),
        }
    }

    /// Approximate footprint in the tier the data lives in
    pub fn size_bytes(&self) -> usize {
        match &self.payload {
            Payload::Resident(batch) => batch_size_bytes(batch),
            Payload::Host(table) => table.size_bytes(),
            Payload::Spilled(file) => file.size_bytes(),
        }
    }

    /// Force the data into a resident batch
    pub fn materialize(self) -> Result<RecordBatch> {
        match self.payload {
            Payload::Resident(batch) => Ok(batch),
            Payload::Host(table) => table.to_batch(),
            Payload::Spilled(file) => file.read(),
        }
    }

    /// Convert to the host representation, keeping the partition id
    pub fn into_host_table(self) -> Result<HostTable> {
        let partition_id = self.partition_id;
        let mut table = match self.payload {
            Payload::Host(table) => table,
            Payload::Resident(batch) => HostTable::from_batch(&batch)?,
            Payload::Spilled(file) => HostTable::from_batch(&file.read()?)?,
        };
        if let Some(id) = partition_id {
            table.set_partition_id(id);
        }
        Ok(table)
    }

    /// Move a resident batch to host memory; other tiers are returned unchanged
    pub fn demote_to_host(self) -> Result<Self> {
        match self.payload {
            Payload::Resident(batch) => {
                let mut table = HostTable::from_batch(&batch)?;
                if let Some(id) = self.partition_id {
                    table.set_partition_id(id);
                }
                Ok(Self {
                    payload: Payload::Host(table),
                    partition_id: self.partition_id,
                })
            }
            payload => Ok(Self {
                payload,
                partition_id: self.partition_id,
            }),
        }
    }

    /// Write the data to a spill file under `dir`
    pub fn spill_to(self, dir: &Path) -> Result<Self> {
        let file = match self.payload {
            Payload::Spilled(_) => return Ok(self),
            Payload::Resident(batch) => SpillFile::write(dir, &batch)?,
            Payload::Host(table) => SpillFile::write(dir, &table.to_batch()?)?,
        };
        Ok(Self {
            payload: Payload::Spilled(file),
            partition_id: self.partition_id,
        })
    }
}

/// Estimate the in-memory size of a record batch in bytes
pub fn batch_size_bytes(batch: &RecordBatch) -> usize {
    batch
        .columns()
        .iter()
        .map(|col| col.get_array_memory_size())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn create_test_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let array = Arc::new(Int64Array::from(values));
        RecordBatch::try_new(schema, vec![array]).unwrap()
    }

    #[test]
    fn test_resident_to_host_keeps_partition() {
        let batch = create_test_batch(vec![1, 2, 3]);
        let data = CacheData::resident(batch.clone()).with_partition_id(4);
        assert_eq!(data.kind(), CacheDataKind::Resident);

        let demoted = data.demote_to_host().unwrap();
        assert_eq!(demoted.kind(), CacheDataKind::Host);
        assert_eq!(demoted.partition_id(), Some(4));
        assert_eq!(demoted.num_rows(), 3);

        let table = demoted.into_host_table().unwrap();
        assert_eq!(table.partition_id(), Some(4));
        assert_eq!(table.to_batch().unwrap(), batch);
    }

    #[test]
    fn test_spill_and_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let batch = create_test_batch(vec![9, 8]);
        let spilled = CacheData::resident(batch.clone())
            .spill_to(dir.path())
            .unwrap();
        assert_eq!(spilled.kind(), CacheDataKind::Spilled);
        assert_eq!(spilled.num_rows(), 2);
        assert_eq!(spilled.materialize().unwrap(), batch);
    }

    #[test]
    fn test_host_data_takes_table_partition() {
        let table = HostTable::from_batch(&create_test_batch(vec![1]))
            .unwrap()
            .with_partition_id(2);
        let data = CacheData::host(table);
        assert_eq!(data.partition_id(), Some(2));
    }
}
