//! Checkpoint CLI entry point
//!
//! Command-line tools for exercising and configuring checkpoints.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

mod commands;

use commands::{config::ConfigCommand, stress::StressCommand};

//-----------------------------------------------------------------------------
// Command Definition
//-----------------------------------------------------------------------------

/// Checkpoint command-line interface
#[derive(Debug, Parser)]
#[command(name = "checkpoint", about = "Checkpoint stress testing and configuration tools")]
struct Cli {
    /// Log filter directive, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hammer a checkpoint from many threads and verify its invariants
    Stress {
        /// Number of worker threads
        #[arg(short, long, default_value = "40")]
        threads: usize,

        /// Number of distinct resource ids the workers compete for
        #[arg(short, long, default_value = "10")]
        applicants: usize,

        /// Shared passes per resource id
        #[arg(short, long)]
        capacity: Option<u32>,

        /// How long to run, in milliseconds
        #[arg(short, long, default_value = "2000")]
        duration_ms: u64,

        /// Extra nesting levels per acquisition; non-zero makes the checkpoint reentrant
        #[arg(short, long, default_value = "0")]
        reentrant_depth: u32,

        /// How long a worker stays in the section, in milliseconds
        #[arg(long, default_value = "1")]
        hold_ms: u64,

        /// Serve waiters in arrival order
        #[arg(long)]
        fair: bool,

        /// Cap on outstanding passes across all resource ids
        #[arg(short, long)]
        global_limit: Option<u32>,

        /// Base configuration file (TOML); flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Inspect checkpoint configuration files
    Config {
        /// Print the default configuration as TOML
        #[arg(long)]
        print_default: bool,

        /// Validate a configuration file and print it normalized
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

//-----------------------------------------------------------------------------
// Main Function
//-----------------------------------------------------------------------------

fn main() {
    let cli = Cli::parse();

    if let Err(err) = checkpoint_core::tracing::init_tracing(Some(&cli.log_level), Some(cli.json)) {
        eprintln!("Failed to initialize logging: {:#}", err);
    }

    let result = match cli.command {
        Command::Stress {
            threads,
            applicants,
            capacity,
            duration_ms,
            reentrant_depth,
            hold_ms,
            fair,
            global_limit,
            config,
        } => StressCommand {
            threads,
            applicants,
            capacity,
            duration_ms,
            reentrant_depth,
            hold_ms,
            fair,
            global_limit,
            config,
        }
        .execute(),
        Command::Config {
            print_default,
            check,
        } => ConfigCommand {
            print_default,
            check,
        }
        .execute(),
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}
