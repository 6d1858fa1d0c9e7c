//! # Backfill Harness CLI (`backfill`)
//!
//! The `backfill` binary drives historical backfills: planning, ingestion,
//! verification, deduplication, monitoring and operator resets.
//!
//! ## Usage
//!
//! ```bash
//! backfill --config ./config/backfill.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `backfill init` | Create the target and progress tables |
//! | `backfill datasets` | List configured datasets and source health |
//! | `backfill plan <dataset>` | Print the batch plan without ingesting |
//! | `backfill ingest <dataset\|all>` | Run or resume ingestion |
//! | `backfill verify <dataset\|all>` | Compare source and target |
//! | `backfill dedupe` | Remove duplicate natural keys |
//! | `backfill monitor` | Live progress view |
//! | `backfill reset <dataset>` | Reset progress records |
//!
//! The target database comes from `BACKFILL_DATABASE_URL` (a `.env` file is
//! honoured) or `[db].url`. The process exits non-zero when a command fails,
//! a dataset ends with failed batches, or verification finds a mismatch.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use backfill_harness::config::{self, DATABASE_URL_ENV};
use backfill_harness::progress::ProgressMode;
use backfill_harness::{
    dedupe, ingest, logging, migrate, monitor, plan, sources, verify,
};

/// Backfill Harness: resumable, density-aware historical backfills.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/backfill.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "backfill",
    about = "Backfill Harness: resumable, density-aware historical backfills",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/backfill.toml")]
    config: PathBuf,

    /// Target database url; overrides `[db].url`.
    #[arg(long, global = true, env = DATABASE_URL_ENV, hide_env_values = true)]
    database_url: Option<String>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the target and progress tables. Safe to run repeatedly.
    Init,

    /// List configured datasets and whether their sources are readable.
    Datasets,

    /// Analyze a dataset and print its batch plan (dry run).
    Plan {
        /// Dataset name from `[datasets.<name>]`.
        dataset: String,
    },

    /// Ingest one dataset or `all`, resuming any earlier run.
    Ingest {
        /// Dataset name, or `all`.
        dataset: String,

        /// Run datasets concurrently instead of one after another.
        #[arg(long)]
        parallel: bool,

        /// Progress output: `off`, `human`, or `json` (stderr).
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Compare source and target; exits non-zero on any mismatch.
    Verify {
        /// Dataset name, or `all`.
        dataset: String,

        /// Print the reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove duplicate natural keys from the target table.
    Dedupe {
        /// Also install a unique index on the key columns.
        #[arg(long)]
        enforce: bool,
    },

    /// Watch ingestion progress until every batch completes.
    Monitor {
        /// Limit the view to these datasets.
        datasets: Vec<String>,

        /// Print one report and exit.
        #[arg(long)]
        once: bool,
    },

    /// Reset a dataset's progress records.
    ///
    /// Without flags every record is removed and the next ingest re-plans.
    Reset {
        dataset: String,

        /// Only re-arm failed batches, keeping their checkpoints.
        #[arg(long)]
        failed_only: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose)?;
    let db_url = cli.database_url.as_deref();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg, db_url).await?;
            println!("Database initialized successfully.");
        }
        Commands::Datasets => {
            sources::list_datasets(&cfg)?;
        }
        Commands::Plan { dataset } => {
            plan::run_plan(&cfg, &dataset).await?;
        }
        Commands::Ingest {
            dataset,
            parallel,
            progress,
        } => {
            let mode = ProgressMode::parse(progress.as_deref())?;
            ingest::run_ingest(&cfg, db_url, &dataset, parallel, mode).await?;
        }
        Commands::Verify { dataset, json } => {
            verify::run_verify(&cfg, db_url, &dataset, json).await?;
        }
        Commands::Dedupe { enforce } => {
            dedupe::run_dedupe(&cfg, db_url, enforce).await?;
        }
        Commands::Monitor { datasets, once } => {
            monitor::run_monitor(&cfg, db_url, datasets, once).await?;
        }
        Commands::Reset {
            dataset,
            failed_only,
        } => {
            ingest::run_reset(&cfg, db_url, &dataset, failed_only).await?;
        }
    }

    Ok(())
}
