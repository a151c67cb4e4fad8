use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Push into a cache after `finish` was called. Unreachable in a correctly wired graph.
    #[error("Closed queue error: cache '{0}' is already finished")]
    ClosedQueueError(String),

    #[error("Cancelled: {0}")]
    CancelledError(String),

    /// A cache was used against the consumption mode it was constructed with.
    #[error("Cache mode error: {0}")]
    CacheModeError(String),

    #[error("Port not connected: {0}")]
    PortNotConnected(String),

    #[error("Source read error in file '{file}': {message}")]
    SourceReadError { file: String, message: String },

    #[error("Remote timeout: no message received for {0}ms")]
    RemoteTimeout(u64),

    #[error("Expression error: {0}")]
    ExpressionError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    ParquetError(String),
}

impl From<parquet::errors::ParquetError> for QueryError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        QueryError::ParquetError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_read_error_names_file() {
        let err = QueryError::SourceReadError {
            file: "part-0001.parquet".to_string(),
            message: "truncated footer".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("part-0001.parquet"));
        assert!(text.contains("truncated footer"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: QueryError = io.into();
        assert!(matches!(err, QueryError::IoError(_)));
    }
}
