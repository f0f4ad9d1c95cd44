//! Canopy CLI
//!
//! Command-line tools for Canopy repositories.
//!
//! # Commands
//!
//! - `inspect` - Display repository statistics
//! - `vacuum` - Purge deleted objects from a file store
//! - `simulate` - Run concurrent units of work under a strategy

mod commands;
mod error;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Canopy command-line repository tools.
#[derive(Parser)]
#[command(name = "canopy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the repository snapshot file
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
    /// Display repository statistics
    Inspect {
        /// List the children of the root
        #[arg(short, long)]
        children: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Purge deleted objects, their descendants and annotations
    Vacuum {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Run concurrent units of work and report how they fared
    Simulate {
        /// Strategy name (none, tid-only, simple, resolve, ...)
        #[arg(short, long, default_value = "resolve")]
        strategy: String,

        /// Workload (counter, children)
        #[arg(short, long, default_value = "counter")]
        workload: String,

        /// Number of concurrent tasks
        #[arg(short, long, default_value = "4")]
        tasks: usize,

        /// Units of work per task
        #[arg(short, long, default_value = "25")]
        operations: usize,

        /// Attempts per unit of work
        #[arg(short, long, default_value = "5")]
        retries: u32,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { children, format } => {
            let path = cli.path.ok_or(CliError::PathRequired("inspect"))?;
            commands::inspect::run(&path, children, &format).await?;
        }
        Commands::Vacuum { dry_run } => {
            let path = cli.path.ok_or(CliError::PathRequired("vacuum"))?;
            commands::vacuum::run(&path, dry_run).await?;
        }
        Commands::Simulate {
            strategy,
            workload,
            tasks,
            operations,
            retries,
            format,
        } => {
            let options = commands::simulate::SimulateOptions {
                strategy: strategy.parse()?,
                workload: workload.parse()?,
                tasks,
                operations_per_task: operations,
                max_retries: retries,
                path: cli.path,
            };
            commands::simulate::run(&options, &format).await?;
        }
        Commands::Version => {
            println!("Canopy CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
