//! tillsync CLI
//!
//! Command-line tools for a till's local replica.
//!
//! # Commands
//!
//! - `inspect` - Record counts, log size and open tabs
//! - `dump-outbox` - Mutations still waiting for the remote
//! - `verify` - Check every log frame and record body
//! - `compact` - Rewrite the log to its live records
//! - `demo` - Run a tab through the sync worker against the reference remote

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tillsync replica tools.
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the replica directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display record counts and open tabs
    Inspect {
        /// List open tabs with their totals
        #[arg(short, long)]
        sessions: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued mutations in delivery order
    DumpOutbox {
        /// Maximum number of mutations to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify log frames and record bodies
    Verify,

    /// Compact the record log
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Run a tab through the sync worker against an in-memory remote
    Demo {
        /// Let remote totals lag behind writes
        #[arg(long)]
        lagging: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { sessions, format } => {
            let path = cli.path.ok_or("Replica path required for inspect")?;
            commands::inspect::run(&path, sessions, &format)?;
        }
        Commands::DumpOutbox { limit, format } => {
            let path = cli.path.ok_or("Replica path required for dump-outbox")?;
            commands::dump_outbox::run(&path, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Replica path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Replica path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Demo { lagging } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(commands::demo::run(cli.path.as_deref(), lagging))?;
        }
        Commands::Version => {
            println!("tillsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
