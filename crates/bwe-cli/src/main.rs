//! Bandwidth-estimation test runner CLI
//!
//! Runs one test case against one implementation: brings up the test
//! subjects, shapes the left and right links phase by phase, and tears
//! everything down when the test duration elapses or on SIGINT/SIGTERM.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_list, cmd_run, load_registry, RunArgs};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bwetest", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Additional test cases (JSON map of name -> test case)
    #[arg(long, global = true)]
    testcases: Option<PathBuf>,

    /// Additional implementations (JSON map of name -> implementation)
    #[arg(long, global = true)]
    implementations: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test run
    Run {
        /// Test case scenario to run
        #[arg(short, long, default_value = "VariableAvailableCapacitySingleFlow")]
        scenario: String,

        /// Implementation to run
        #[arg(short, long, default_value = "pion-gcc")]
        implementation: String,

        /// Unix timestamp in seconds recorded in config.json (default: now)
        #[arg(short, long)]
        date: Option<i64>,

        /// Output directory for logs and config.json
        #[arg(long, default_value = "output")]
        output: PathBuf,

        /// Directory compose files are looked up in
        #[arg(long, default_value = ".")]
        compose_dir: PathBuf,

        /// Seconds to wait for router containers to appear
        #[arg(long, default_value_t = 300)]
        discovery_timeout: u64,
    },

    /// List available test cases and implementations
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG overrides --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let registry = load_registry(cli.testcases.as_deref(), cli.implementations.as_deref())?;

    match cli.command {
        Commands::Run {
            scenario,
            implementation,
            date,
            output,
            compose_dir,
            discovery_timeout,
        } => {
            let args = RunArgs {
                scenario,
                implementation,
                date: date.unwrap_or_else(|| chrono::Utc::now().timestamp()),
                output,
                compose_dir,
                discovery_timeout,
            };
            cmd_run(&registry, args).await?;
        }
        Commands::List => {
            cmd_list(&registry)?;
        }
    }

    Ok(())
}
