//! CloudSync CLI
//!
//! Offline tools for replica directories. Every command is read-only and
//! can run while no application holds the replica open.
//!
//! # Commands
//!
//! - `inspect` - Display replica identity, checkpoint and storage statistics
//! - `verify` - Verify frame integrity and payload decoding
//! - `dump-log` - Dump change log entries for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CloudSync command-line replica tools.
#[derive(Parser)]
#[command(name = "cloudsync")]
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
    /// Display replica identity, checkpoint and storage statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify replica integrity
    Verify {
        /// Check the change log
        #[arg(short, long)]
        changes: bool,

        /// Check the record store
        #[arg(short, long)]
        records: bool,

        /// Check the checkpoint history
        #[arg(short = 'k', long)]
        checkpoint: bool,

        /// Check all (default if no flags specified)
        #[arg(short, long)]
        all: bool,
    },

    /// Dump change log entries for debugging
    DumpLog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only entries with a seq above this one
        #[arg(short, long, default_value = "0")]
        since: u64,

        /// Include entries already acknowledged by a checkpoint
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
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
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Replica path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Verify {
            changes,
            records,
            checkpoint,
            all,
        } => {
            let path = cli.path.ok_or("Replica path required for verify")?;
            let check_all = all || (!changes && !records && !checkpoint);
            let checks = commands::verify::Checks {
                changes: changes || check_all,
                records: records || check_all,
                checkpoint: checkpoint || check_all,
            };
            commands::verify::run(&path, checks)?;
        }
        Commands::DumpLog {
            limit,
            since,
            all,
            format,
        } => {
            let path = cli.path.ok_or("Replica path required for dump-log")?;
            commands::dump_log::run(&path, limit, since, all, &format)?;
        }
        Commands::Version => {
            println!("CloudSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("CloudSync Engine v{}", cloudsync_engine::VERSION);
            println!(
                "Sync protocol v{}",
                cloudsync_protocol::PROTOCOL_VERSION
            );
        }
    }

    Ok(())
}
