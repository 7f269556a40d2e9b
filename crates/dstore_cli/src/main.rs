//! dstore CLI
//!
//! Command-line tools for exploring dstore behavior against the in-memory
//! backend.
//!
//! # Commands
//!
//! - `plan` - Show which index serves a query, or the index it needs
//! - `simulate` - Run a fault-injected transaction workload

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// dstore command-line tools.
#[derive(Parser)]
#[command(name = "dstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Explain index selection for a query
    Plan {
        /// Entity kind to query (empty for a kindless query)
        #[arg(short, long, default_value = "")]
        kind: String,

        /// Declared composite index, like `Item:a,-b` (repeatable)
        #[arg(short, long = "index")]
        indexes: Vec<String>,

        /// Filter like `a=1`, `c<5` or `name>="x"` (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Sort order like `c` or `-c` (repeatable)
        #[arg(short, long = "order")]
        orders: Vec<String>,

        /// Ancestor key path like `Parent:1` or `Parent:1/Child:"x"`
        #[arg(short, long)]
        ancestor: Option<String>,

        /// Projected property (repeatable)
        #[arg(short, long = "project")]
        projection: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run concurrent counter transactions through injected faults
    Simulate {
        /// Transactions per thread
        #[arg(short, long, default_value = "100")]
        transactions: usize,

        /// Number of worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Number of counter entity groups
        #[arg(short, long, default_value = "2")]
        groups: usize,

        /// Attempts per transaction
        #[arg(short, long, default_value = "3")]
        attempts: u32,

        /// Probability of an injected deadline on every call
        #[arg(long, default_value = "0.05")]
        deadline: f64,

        /// Probability of an injected conflict on commit
        #[arg(long, default_value = "0.1")]
        conflict: f64,

        /// Seed for the fault generator
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Plan {
            kind,
            indexes,
            filters,
            orders,
            ancestor,
            projection,
            format,
        } => {
            let args = commands::plan::PlanArgs {
                kind,
                indexes,
                filters,
                orders,
                ancestor,
                projection,
            };
            commands::plan::run(&args, &format)?;
        }
        Commands::Simulate {
            transactions,
            threads,
            groups,
            attempts,
            deadline,
            conflict,
            seed,
            format,
        } => {
            let args = commands::simulate::SimulateArgs {
                transactions,
                threads,
                groups,
                attempts,
                deadline,
                conflict,
                seed,
            };
            commands::simulate::run(&args, &format)?;
        }
        Commands::Version => {
            println!("dstore CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
