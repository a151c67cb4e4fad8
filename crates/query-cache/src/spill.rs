//! Spilled batches
//!
//! A [`SpillFile`] owns an Arrow IPC file on local disk. The file is removed
//! when the handle is dropped, whether or not it was ever read back.

use arrow::compute::concat_batches;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    num_rows: usize,
    size_bytes: usize,
}

impl SpillFile {
    /// Write `batch` to a fresh file under `dir`
    pub fn write(dir: &Path, batch: &RecordBatch) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("spill-{}.arrow", Uuid::new_v4().simple()));
        let file = File::create(&path)?;
        {
            let mut writer = FileWriter::try_new(BufWriter::new(file), &batch.schema())?;
            writer.write(batch)?;
            writer.finish()?;
        }
        let size_bytes = std::fs::metadata(&path)?.len() as usize;
        debug!(
            "Spilled {} rows ({} bytes) to {}",
            batch.num_rows(),
            size_bytes,
            path.display()
        );

        Ok(Self {
            path,
            num_rows: batch.num_rows(),
            size_bytes,
        })
    }

    /// Read the spilled batch back into memory
    pub fn read(&self) -> Result<RecordBatch> {
        let file = File::open(&self.path)?;
        let reader = FileReader::try_new(BufReader::new(file), None)?;
        let schema = reader.schema();
        let mut batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;

        match batches.len() {
            0 => Err(QueryError::SerializationError(format!(
                "Spill file {} contains no batch",
                self.path.display()
            ))),
            1 => Ok(batches.remove(0)),
            _ => Ok(concat_batches(&schema, &batches)?),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove spill file {}: {}", self.path.display(), e);
            }
        }
    }
}
