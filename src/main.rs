//! # pricewatch CLI
//!
//! ## Usage
//!
//! ```bash
//! pricewatch --config ./config/pricewatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pricewatch init` | Create the SQLite database and run schema migrations |
//! | `pricewatch sources` | List configured sources with credential and job status |
//! | `pricewatch scrape <source>` | Run one full scrape in the foreground |
//! | `pricewatch run` | Start the scheduler (hourly scrapes, token sweep, cleanup) |
//! | `pricewatch jobs` | List recent scrape jobs |
//! | `pricewatch job <id>` | Show one job in detail |
//! | `pricewatch history <product>` | Price change history of a product |
//! | `pricewatch compare <product>` | Latest prices of a product and its linked counterparts |
//! | `pricewatch compare-barcode <barcode>` | Latest prices of everything sharing a barcode |
//! | `pricewatch relink <product>` | Recompute barcode links |
//! | `pricewatch prune` | Drop price records past the retention window |
//!
//! Log verbosity follows `RUST_LOG` (default `pricewatch=info`). Logs go to
//! stderr; reports go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pricewatch::{commands, config, migrate, sources};

/// pricewatch: scheduled price tracking across grocery apps.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pricewatch.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pricewatch",
    about = "Scheduled multi-source catalog scraping with cross-app price comparison",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pricewatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources and their status.
    Sources,

    /// Run one full-catalog scrape in the foreground.
    ///
    /// Resumes from the source's checkpoint when the previous job did not
    /// finish its walk. Ctrl-C cancels the job and keeps the checkpoint.
    Scrape {
        /// Source name from `[sources.<name>]`, or `all`.
        source: String,

        /// Ignore the checkpoint and walk the whole catalog.
        #[arg(long)]
        full: bool,
    },

    /// Start the scheduler and run until Ctrl-C.
    Run,

    /// List recent scrape jobs, newest first.
    Jobs {
        /// Only jobs of this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one scrape job.
    Job {
        /// Job UUID.
        id: String,
    },

    /// Show the price change history of a product.
    History {
        /// Product id, or `<source>/<source_product_id>`.
        product: String,

        /// Only this unit (e.g. `piece`, `carton`).
        #[arg(long)]
        unit: Option<String>,

        /// Only records on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Print a per-day min/max/close summary of the last N days instead.
        #[arg(long)]
        days: Option<u32>,
    },

    /// Compare a product's latest prices with its linked counterparts.
    Compare {
        /// Product id, or `<source>/<source_product_id>`.
        product: String,
    },

    /// Latest price of every source and unit sharing a barcode.
    CompareBarcode { barcode: String },

    /// Recompute barcode links for a product or a barcode group.
    Relink {
        /// Product id, or `<source>/<source_product_id>`.
        product: Option<String>,

        #[arg(long, conflicts_with = "product")]
        barcode: Option<String>,
    },

    /// Delete price records older than the retention window.
    ///
    /// The newest record of every product unit is always kept.
    Prune {
        /// Override `schedule.retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pricewatch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Scrape { source, full } => {
            commands::run_scrape(&cfg, &source, full).await?;
        }
        Commands::Run => {
            commands::run_daemon(&cfg).await?;
        }
        Commands::Jobs { source, limit } => {
            commands::list_jobs(&cfg, source, limit).await?;
        }
        Commands::Job { id } => {
            commands::show_job(&cfg, &id).await?;
        }
        Commands::History {
            product,
            unit,
            since,
            days,
        } => {
            commands::show_history(&cfg, &product, unit, since, days).await?;
        }
        Commands::Compare { product } => {
            commands::run_compare(&cfg, &product).await?;
        }
        Commands::CompareBarcode { barcode } => {
            commands::run_compare_barcode(&cfg, &barcode).await?;
        }
        Commands::Relink { product, barcode } => {
            commands::run_relink(&cfg, product, barcode).await?;
        }
        Commands::Prune { days } => {
            commands::run_prune(&cfg, days).await?;
        }
    }

    Ok(())
}
