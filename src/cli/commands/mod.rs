//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod groups;
mod init;
mod intake;
mod pages;
mod run;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "pagebind")]
#[command(about = "Parallel OCR of scanned pages with ordered group assembly")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, short = 't', global = true)]
    target: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Store page images and assign sequence numbers in argument order
    Intake {
        /// Image files, in page order
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Mark the new pages reviewed right away
        #[arg(long)]
        review: bool,
    },

    /// Mark pages reviewed so they become eligible for OCR
    Review {
        /// Sequence numbers to update
        sequences: Vec<i64>,
        /// Apply to every page not yet grouped
        #[arg(long, conflicts_with = "sequences")]
        all: bool,
        /// Clear the review flag instead of setting it
        #[arg(long)]
        unset: bool,
        /// Replacement image for a single page
        #[arg(long, conflicts_with = "all")]
        edited: Option<PathBuf>,
    },

    /// Run the OCR and grouping pipeline
    Run {
        /// Process what is ready, then exit
        #[arg(long)]
        once: bool,
        /// Use at most this many workers (one per credential)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Release claims held longer than the stuck timeout
    Reclaim,

    /// Show page and group counters
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List pages with their OCR and grouping state
    Pages {
        /// Start after this sequence number
        #[arg(long, default_value = "0")]
        after: i64,
        /// Maximum number of pages to list
        #[arg(short, long, default_value = "100")]
        limit: i64,
    },

    /// List page groups and their members
    Groups {
        /// Show a single group with its pages
        #[arg(long)]
        id: Option<i32>,
        /// Maximum number of groups to list
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (settings, _config) = load_settings_with_options(LoadOptions {
        config_path: cli.config,
        data_dir: cli.target,
    })
    .await?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Intake { files, review } => intake::cmd_intake(&settings, &files, review).await,
        Commands::Review {
            sequences,
            all,
            unset,
            edited,
        } => intake::cmd_review(&settings, &sequences, all, !unset, edited.as_deref()).await,
        Commands::Run { once, workers } => run::cmd_run(&settings, once, workers).await,
        Commands::Reclaim => run::cmd_reclaim(&settings).await,
        Commands::Status { json } => status::cmd_status(&settings, json).await,
        Commands::Pages { after, limit } => pages::cmd_pages(&settings, after, limit).await,
        Commands::Groups { id, limit } => match id {
            Some(id) => groups::cmd_group(&settings, id).await,
            None => groups::cmd_groups(&settings, limit).await,
        },
    }
}
