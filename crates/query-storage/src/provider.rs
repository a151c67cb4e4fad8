//! File-list provider shared by the file-backed sources

use query_core::{QueryError, Result};
use query_executor::{DataHandle, DataProvider};

/// Hands out a fixed list of paths in order
#[derive(Debug, Clone, Default)]
pub struct FileListProvider {
    files: Vec<String>,
    position: usize,
}

impl FileListProvider {
    pub fn new<S: AsRef<str>>(files: &[S]) -> Self {
        Self {
            files: files.iter().map(|f| f.as_ref().to_string()).collect(),
            position: 0,
        }
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }
}

impl DataProvider for FileListProvider {
    fn has_next(&mut self) -> bool {
        self.position < self.files.len()
    }

    fn get_next(&mut self) -> Result<DataHandle> {
        let file = self.files.get(self.position).ok_or_else(|| {
            QueryError::ExecutionError(format!(
                "provider exhausted after {} files",
                self.files.len()
            ))
        })?;
        self.position += 1;
        Ok(DataHandle::new(file.as_str()))
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}
