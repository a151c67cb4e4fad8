//! Host-resident batches
//!
//! A [`HostTable`] is a batch encoded as an Arrow IPC stream. It is the unit
//! that crosses node boundaries and the tier a cache demotes batches to when
//! resident memory runs short.

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Serialized record batch held in host memory
#[derive(Debug, Serialize, Deserialize)]
pub struct HostTable {
    /// IPC-encoded Arrow data
    data: Vec<u8>,
    /// Number of rows
    num_rows: usize,
    /// Shuffle routing key stamped by the producer or the exchange listener
    partition_id: Option<u32>,
}

impl HostTable {
    /// Serialize a record batch using Arrow IPC format
    pub fn from_batch(batch: &RecordBatch) -> Result<Self> {
        let mut buffer = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buffer, &batch.schema())
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
            writer
                .write(batch)
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
            writer
                .finish()
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
        }

        Ok(Self {
            data: buffer,
            num_rows: batch.num_rows(),
            partition_id: None,
        })
    }

    /// Wrap bytes received from the network
    pub fn from_ipc_bytes(data: Vec<u8>, num_rows: usize) -> Self {
        Self {
            data,
            num_rows,
            partition_id: None,
        }
    }

    /// Deserialize back into a record batch
    pub fn to_batch(&self) -> Result<RecordBatch> {
        let cursor = Cursor::new(&self.data);
        let mut reader = StreamReader::try_new(cursor, None)
            .map_err(|e| QueryError::SerializationError(e.to_string()))?;

        match reader.next() {
            Some(batch) => batch.map_err(|e| QueryError::SerializationError(e.to_string())),
            None => Err(QueryError::SerializationError(
                "No batch found in host table".to_string(),
            )),
        }
    }

    pub fn with_partition_id(mut self, partition_id: u32) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    pub fn set_partition_id(&mut self, partition_id: u32) {
        self.partition_id = Some(partition_id);
    }

    pub fn partition_id(&self) -> Option<u32> {
        self.partition_id
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
