//! DMARC pipeline command line tool

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use dmarc_common::logging::{init_logging, LogConfig, LogLevel};
use dmarc_pipeline::db::{create_pool, run_migrations};
use dmarc_pipeline::{ContentStore, IngestionCoordinator, PipelineConfig, ProcessingCoordinator};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// File extensions accepted by `import`
const IMPORT_EXTENSIONS: [&str; 3] = ["xml", "gz", "zip"];

#[derive(Parser, Debug)]
#[command(name = "dmarc")]
#[command(author, version, about = "DMARC aggregate report pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Import report files from a directory
    Import {
        /// Directory to scan for .xml, .gz and .zip files
        dir: PathBuf,

        /// Process imported entries in the same run
        #[arg(long)]
        sync: bool,

        /// Entries claimed per processing batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Process pending entries
    Process {
        /// Entries claimed per processing batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Reset failed entries to pending and process them again
    Retry {
        /// Entries claimed per processing batch
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

struct Pipeline {
    ingestion: IngestionCoordinator,
    processing: ProcessingCoordinator,
    batch_size: usize,
}

async fn connect(config: &PipelineConfig) -> Result<Pipeline> {
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    run_migrations(&pool).await?;

    let store = ContentStore::new(config.storage.root.clone());

    Ok(Pipeline {
        ingestion: IngestionCoordinator::new(pool.clone(), store.clone()),
        processing: ProcessingCoordinator::new(pool, store),
        batch_size: config.processing.batch_size,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env()?.with_level(log_level);
    let _guard = init_logging(&log_config)?;

    let config = PipelineConfig::load()?;

    match cli.command {
        Command::Import {
            dir,
            sync,
            batch_size,
        } => {
            let pipeline = connect(&config).await?;
            let batch_size = batch_size.unwrap_or(pipeline.batch_size);
            import(&pipeline, &dir, sync, batch_size).await?;
        }
        Command::Process { batch_size } => {
            let pipeline = connect(&config).await?;
            let batch_size = batch_size.unwrap_or(pipeline.batch_size);
            let stats = pipeline.processing.process_pending(batch_size).await?;
            println!("Processed: {}, failed: {}", stats.processed, stats.failed);
        }
        Command::Retry { batch_size } => {
            let pipeline = connect(&config).await?;
            let batch_size = batch_size.unwrap_or(pipeline.batch_size);
            let stats = pipeline.processing.reprocess_failed(batch_size).await?;
            println!("Processed: {}, failed: {}", stats.processed, stats.failed);
        }
    }

    Ok(())
}

/// Walk `dir` and ingest every report file found
///
/// Per-file failures are counted and reported; only a missing or unreadable
/// directory aborts the import.
async fn import(pipeline: &Pipeline, dir: &Path, sync: bool, batch_size: usize) -> Result<()> {
    if !dir.is_dir() {
        bail!("Import directory does not exist: {}", dir.display());
    }

    info!(dir = %dir.display(), "Starting import");

    let mut imported = 0u64;
    let mut duplicates = 0u64;
    let mut errors = 0u64;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.context("Failed to walk import directory")?;
        if !entry.file_type().is_file() || !is_report_file(entry.path()) {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().to_string();

        let bytes = match tokio::fs::read(entry.path()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to read file");
                errors += 1;
                continue;
            }
        };

        let message_id = format!("import:{filename}");
        match pipeline
            .ingestion
            .ingest(&filename, &bytes, &message_id, Utc::now())
            .await
        {
            Ok(outcome) if outcome.is_new => imported += 1,
            Ok(_) => duplicates += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to ingest file");
                errors += 1;
            }
        }
    }

    println!("Imported: {imported}, duplicates: {duplicates}, errors: {errors}");

    if sync {
        let mut processed = 0u64;
        let mut failed = 0u64;
        loop {
            let stats = pipeline.processing.process_pending(batch_size).await?;
            if stats.processed + stats.failed == 0 {
                break;
            }
            processed += stats.processed;
            failed += stats.failed;
        }
        println!("Processed: {processed}, failed: {failed}");
    }

    Ok(())
}

fn is_report_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            IMPORT_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}
