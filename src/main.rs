//! # drive-ingest CLI
//!
//! ## Usage
//!
//! ```bash
//! drive-ingest --config ./config/drive-ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `drive-ingest init` | Create the SQLite database and run schema migrations |
//! | `drive-ingest process` | List, detect changes, extract, chunk, embed, write |
//! | `drive-ingest ingest <artifact>` | Reconcile the index schema and import an export |
//! | `drive-ingest run` | `process` then `ingest`, under one run id |
//! | `drive-ingest chunk <file>` | Extract and chunk a local file |
//! | `drive-ingest ledger` | Show the seen-file ledger |
//!
//! Summaries go to stdout; logs go to stderr (`RUST_LOG` controls the level).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use drive_ingest::chunk::{chunk_text, ChunkerConfig};
use drive_ingest::config;
use drive_ingest::extract::extract_text;
use drive_ingest::ingest::IngestReport;
use drive_ingest::ledger::SqliteLedger;
use drive_ingest::models::FileFormat;
use drive_ingest::pipeline::{self, RunOverrides};
use drive_ingest::process::ProcessReport;
use drive_ingest::reconcile::ReconcileOutcome;

/// Incremental document ingestion from a shared drive into a warehouse and
/// a managed search index.
#[derive(Parser)]
#[command(name = "drive-ingest", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/drive-ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run the Document Processor stage.
    Process,

    /// Run the Index Ingestor stage on an export artifact.
    Ingest {
        /// JSONL file written by `process`.
        artifact: PathBuf,
    },

    /// Run both stages in sequence and print the run id.
    Run {
        #[arg(long)]
        project_id: Option<String>,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        drive_folder_id: Option<String>,

        /// User the access token was delegated for.
        #[arg(long)]
        impersonation_user: Option<String>,
    },

    /// Extract and chunk a local file, printing the chunks.
    ///
    /// Does not read the configuration file.
    Chunk {
        file: PathBuf,

        #[arg(long, default_value_t = 1500)]
        chunk_size: usize,

        #[arg(long, default_value_t = 200)]
        chunk_overlap: usize,
    },

    /// List every file recorded in the seen-file ledger.
    Ledger,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("drive_ingest=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Chunk {
        file,
        chunk_size,
        chunk_overlap,
    } = &cli.command
    {
        return run_chunk(file, *chunk_size, *chunk_overlap);
    }

    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = pipeline::open_store(&cfg).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Process => {
            let report = pipeline::run_process(&cfg).await?;
            print_process_report(&cfg.drive.folder_id, &report);
            println!("ok");
        }
        Commands::Ingest { artifact } => {
            let report = pipeline::run_ingest(&cfg, &artifact).await?;
            print_ingest_report(&artifact, &report);
            println!("ok");
        }
        Commands::Run {
            project_id,
            location,
            drive_folder_id,
            impersonation_user,
        } => {
            RunOverrides {
                project_id,
                location,
                drive_folder_id,
                impersonation_user,
            }
            .apply(&mut cfg);
            config::validate(&cfg)?;

            let run_id = Uuid::new_v4();
            println!("run {}", run_id);
            let summary = pipeline::run_pipeline(&cfg, run_id).await?;
            print_process_report(&cfg.drive.folder_id, &summary.process);
            print_ingest_report(&summary.process.artifact.path, &summary.ingest);
            println!("ok");
        }
        Commands::Ledger => {
            let pool = pipeline::open_store(&cfg).await?;
            let entries = SqliteLedger::new(pool.clone()).entries().await?;
            for (file_id, entry) in &entries {
                println!(
                    "{}\t{}\t{}",
                    file_id,
                    entry.modified_time.to_rfc3339(),
                    entry.content_hash
                );
            }
            println!("{} files", entries.len());
            pool.close().await;
        }
        Commands::Chunk { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

fn run_chunk(file: &std::path::Path, chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    let name = file.to_string_lossy();
    let format = FileFormat::resolve("", &name)?;
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let text = extract_text(&bytes, format)?;
    let chunker = ChunkerConfig::new(chunk_size, chunk_overlap)?;

    let chunks = chunk_text(&text, &chunker);
    for (i, chunk) in chunks.iter().enumerate() {
        println!("--- chunk {} ({} chars) ---", i, chunk.chars().count());
        println!("{}", chunk);
    }
    println!("{} chunks", chunks.len());
    Ok(())
}

fn print_process_report(folder_id: &str, report: &ProcessReport) {
    let d = &report.detection;
    println!("process {}", folder_id);
    println!("  listed: {} files", report.listed);
    println!(
        "  new: {}, modified: {}, unchanged: {}, metadata-only: {}",
        d.new, d.modified, d.unchanged, d.metadata_only
    );
    for failure in &report.failures {
        println!("  failed: {} ({}): {}", failure.name, failure.file_id, failure.error);
    }
    println!("  chunks written: {}", report.chunks_written);
    if report.chunks_missing > 0 {
        println!(
            "  chunks missing: {} ({} failed embedding batches)",
            report.chunks_missing, report.failed_batches
        );
    }
    println!("  committed: {} files", report.committed);
    if report.incomplete > 0 {
        println!("  incomplete: {} files (retried next run)", report.incomplete);
    }
    println!(
        "  artifact: {} ({} records)",
        report.artifact.path.display(),
        report.artifact.records
    );
    if report.artifact.removed > 0 {
        println!("  pruned: {} stale chunks", report.artifact.removed);
    }
}

fn print_ingest_report(artifact: &std::path::Path, report: &IngestReport) {
    println!("ingest {}", artifact.display());
    let schema = match report.schema {
        ReconcileOutcome::AlreadyCurrent => "already current",
        ReconcileOutcome::Updated => "updated",
    };
    println!("  schema: {}", schema);
    println!(
        "  imported: {} documents in {} operations",
        report.documents,
        report.operations.len()
    );
    if report.deleted > 0 {
        println!("  deleted: {} stale documents", report.deleted);
    }
}
