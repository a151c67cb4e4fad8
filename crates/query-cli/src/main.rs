use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod pipeline;

use config::Config;
use pipeline::{build_pipeline, RunOptions};

#[derive(Parser)]
#[command(name = "qe")]
#[command(author, version, about = "Query Engine - batch pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan files through an optional filter and projection and print the rows
    Run {
        /// Input files (CSV or Parquet, one format per run)
        #[arg(short, long, required = true, num_args = 1..)]
        file: Vec<String>,

        /// Filter condition, e.g. ">($0, 10)"
        #[arg(long)]
        filter: Option<String>,

        /// Output columns, e.g. "id=[$0], total=[+($1, $2)]"
        #[arg(short, long)]
        project: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    print_banner();

    match cli.command {
        Commands::Run {
            file,
            filter,
            project,
        } => run(&config, &file, RunOptions { filter, project })?,
    }

    Ok(())
}

fn run(config: &Config, files: &[String], options: RunOptions) -> Result<()> {
    let started = Instant::now();
    let pipeline = build_pipeline(files, &options, &config.engine, None)?;
    pipeline.graph.execute()?;

    if config.show_estimates {
        for &id in &pipeline.kernels {
            if let Some(kernel) = pipeline.graph.kernel(id) {
                let estimate = pipeline
                    .graph
                    .estimated_output_num_rows(id)
                    .map(|rows| rows.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "{} {}",
                    format!("{:>16}", kernel.kernel_type().to_string()).bright_blue(),
                    format!("~{} rows", estimate).bright_black()
                );
            }
        }
    }
    if config.show_timing {
        println!(
            "{}",
            format!("Completed in {:.3}s", started.elapsed().as_secs_f64()).bright_green()
        );
    }
    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        "query_cli=debug,query_cache=debug,query_distributed=debug,query_executor=debug,query_storage=debug"
    } else {
        "query_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
   ___                          _____            _
  / _ \ _   _  ___ _ __ _   _  | ____|_ __   __ _(_)_ __   ___
 | | | | | | |/ _ \ '__| | | | |  _| | '_ \ / _` | | '_ \ / _ \
 | |_| | |_| |  __/ |  | |_| | | |___| | | | (_| | | | | |  __/
  \__\_\\__,_|\___|_|   \__, | |_____|_| |_|\__, |_|_| |_|\___|
                        |___/               |___/
    "#
        .bright_cyan()
    );
    println!("{}", "Batch Pipeline Runner v0.1.0\n".bright_yellow());
}
