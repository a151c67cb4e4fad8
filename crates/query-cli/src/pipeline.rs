//! Assemble a scan → filter → project → print graph from the command line

use anyhow::{bail, Result};
use query_core::Context;
use query_executor::{
    ArrowComputeEngine, ComputeEngine, DataLoader, EngineConfig, ExecutionGraph, Filter, KernelId,
    Print, PrintSink, Projection, TableSchema, TableScan,
};
use query_storage::{CsvDataSource, ParquetDataSource};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Parquet,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Ok(FileFormat::Csv),
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => Ok(FileFormat::Parquet),
            _ => bail!("Unsupported file type: {}", path.display()),
        }
    }
}

/// Options of one `qe run`
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    pub filter: Option<String>,
    pub project: Option<String>,
}

pub struct Pipeline {
    pub graph: ExecutionGraph,
    pub kernels: Vec<KernelId>,
}

fn open_table(files: &[String]) -> Result<(DataLoader, TableSchema)> {
    let Some(first) = files.first() else {
        bail!("No input files given");
    };
    let format = FileFormat::from_path(Path::new(first))?;
    for file in files {
        if FileFormat::from_path(Path::new(file))? != format {
            bail!("All input files must share one format");
        }
    }

    Ok(match format {
        FileFormat::Csv => {
            let source = Arc::new(CsvDataSource::infer(files)?);
            let table = source.table_schema();
            (source.loader(), table)
        }
        FileFormat::Parquet => {
            let source = Arc::new(ParquetDataSource::open(files)?);
            let table = source.table_schema();
            (source.loader(), table)
        }
    })
}

pub fn build_pipeline(
    files: &[String],
    options: &RunOptions,
    config: &EngineConfig,
    sink: Option<PrintSink>,
) -> Result<Pipeline> {
    let context = Arc::new(Context::local(std::process::id()));
    let engine: Arc<dyn ComputeEngine> = Arc::new(ArrowComputeEngine::new());
    let (loader, table) = open_table(files)?;
    info!(
        "Scanning {} file(s), {} column(s)",
        table.files().len(),
        table.schema().fields().len()
    );

    let mut graph = ExecutionGraph::with_config(Arc::clone(&context), config.clone());
    let mut kernels = Vec::new();
    let scan = graph.add_kernel(Arc::new(TableScan::new(
        "TableScan",
        loader,
        table,
        Arc::clone(&context),
    )));
    kernels.push(scan);

    if let Some(condition) = &options.filter {
        let filter = graph.add_kernel(Arc::new(Filter::new(
            format!("LogicalFilter(condition=[{}])", condition),
            Arc::clone(&context),
            Arc::clone(&engine),
        )));
        kernels.push(filter);
    }
    if let Some(items) = &options.project {
        let project = graph.add_kernel(Arc::new(Projection::new(
            format!("LogicalProject({})", items),
            Arc::clone(&context),
            Arc::clone(&engine),
        )));
        kernels.push(project);
    }

    let print = match sink {
        Some(sink) => Print::with_sink(Arc::clone(&context), sink),
        None => Print::new(Arc::clone(&context)),
    };
    kernels.push(graph.add_kernel(Arc::new(print)));

    for pair in kernels.windows(2) {
        graph.connect_default(pair[0], pair[1])?;
    }
    Ok(Pipeline { graph, kernels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::TempDir;

    /// Writer that keeps a copy of everything printed
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn write_csv(dir: &TempDir) -> String {
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "id,name\n1,alice\n2,bob\n3,carol\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            FileFormat::from_path(Path::new("a.PARQUET")).unwrap(),
            FileFormat::Parquet
        );
        assert_eq!(FileFormat::from_path(Path::new("a.csv")).unwrap(), FileFormat::Csv);
        assert!(FileFormat::from_path(Path::new("a.json")).is_err());
    }

    #[test]
    fn test_run_filter_and_project() {
        let dir = TempDir::new().unwrap();
        let file = write_csv(&dir);
        let captured = Captured::default();
        let sink: PrintSink = Arc::new(Mutex::new(Box::new(captured.clone())));

        let options = RunOptions {
            filter: Some(">($0, 1)".to_string()),
            project: Some("who=[$1]".to_string()),
        };
        let pipeline =
            build_pipeline(&[file], &options, &EngineConfig::default(), Some(sink)).unwrap();
        assert_eq!(pipeline.kernels.len(), 4);
        pipeline.graph.execute().unwrap();

        let text = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(text.contains("who"));
        assert!(text.contains("bob"));
        assert!(text.contains("carol"));
        assert!(!text.contains("alice"));
    }

    #[test]
    fn test_mixed_formats_rejected() {
        let files = vec!["a.csv".to_string(), "b.parquet".to_string()];
        assert!(build_pipeline(&files, &RunOptions::default(), &EngineConfig::default(), None).is_err());
    }
}
