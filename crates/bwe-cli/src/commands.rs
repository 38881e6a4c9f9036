//! CLI command implementations for the test runner
//!
//! Kept out of main.rs so they can be unit tested.

use anyhow::{Context, Result};
use bwe_testbench::{supervisor_for, DiscoveryConfig, RunOptions};
use scenarios::{Implementation, Registry, TestCase};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Subdirectories the compose files mount for each flow slot
const OUTPUT_SUBDIRS: [&str; 6] = [
    "a/send_log",
    "a/receive_log",
    "a/output",
    "b/send_log",
    "b/receive_log",
    "b/output",
];

pub struct RunArgs {
    pub scenario: String,
    pub implementation: String,
    pub date: i64,
    pub output: PathBuf,
    pub compose_dir: PathBuf,
    pub discovery_timeout: u64,
}

/// Built-in test cases and implementations, extended by optional files
pub fn load_registry(
    testcases: Option<&Path>,
    implementations: Option<&Path>,
) -> Result<Registry> {
    let mut registry = Registry::builtin();
    if let Some(path) = testcases {
        registry.load_test_cases(path)?;
    }
    if let Some(path) = implementations {
        registry.load_implementations(path)?;
    }
    Ok(registry)
}

/// Implementation of the 'run' command
pub async fn cmd_run(registry: &Registry, args: RunArgs) -> Result<()> {
    let case = registry.test_case(&args.scenario)?;
    let implementation = registry.implementation(&args.implementation)?;
    info!(
        "Running {} with {} ({:?})",
        case.name,
        implementation.name,
        case.duration()
    );

    prepare_output(&args.output, args.date, case, implementation)?;

    let options = RunOptions {
        output_dir: args.output.clone(),
        compose_dir: args.compose_dir.clone(),
        discovery: DiscoveryConfig {
            timeout: Duration::from_secs(args.discovery_timeout),
            ..Default::default()
        },
        ..Default::default()
    };
    let supervisor =
        supervisor_for(case, implementation, &options).context("failed to set up test run")?;
    let report = supervisor.run(shutdown_signal()).await?;

    println!("Test run finished: {}", report.ended_by);
    for link in [&report.left, &report.right] {
        println!(
            "  {:<12} {:<10} {} phase(s) applied",
            link.name, link.state, link.phases_applied
        );
    }
    println!("Elapsed: {:.1}s", report.elapsed.as_secs_f64());

    report
        .write_json(args.output.join("report.json"))
        .context("failed to write run report")?;
    Ok(())
}

/// Implementation of the 'list' command
pub fn cmd_list(registry: &Registry) -> Result<()> {
    println!("Available test cases:");
    println!("=====================");
    for case in registry.test_cases() {
        println!(
            "  {:<52} [{}] {}",
            case.name, case.backend, case.description
        );
    }

    println!("\nAvailable implementations:");
    for name in registry.implementation_names() {
        let implementation = registry.implementation(name)?;
        println!(
            "  {:<20} sender={} receiver={}",
            name, implementation.sender.image, implementation.receiver.image
        );
    }
    Ok(())
}

/// Create the output layout and record what is being run
fn prepare_output(
    output: &Path,
    date: i64,
    case: &TestCase,
    implementation: &Implementation,
) -> Result<()> {
    for dir in OUTPUT_SUBDIRS {
        let path = output.join(dir);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }

    let config = serde_json::json!({
        "date": date,
        "scenario": case,
        "implementation": implementation,
    });
    let path = output.join("config.json");
    std::fs::write(&path, serde_json::to_vec(&config)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c() => info!("Interrupted by user"),
                    _ = terminate.recv() => info!("Terminated"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                ctrl_c().await;
                info!("Interrupted by user");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await;
        info!("Interrupted by user");
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
