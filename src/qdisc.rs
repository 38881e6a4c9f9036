//! Traffic-control commands issued inside router containers
//!
//! Shaping is two stacked qdiscs: netem at `root handle 1:` for delay and
//! tbf at `parent 1: handle 2:` for rate. The first application of a
//! schedule uses `tc qdisc add`; every later one uses `tc qdisc change`.

use crate::discovery::ActuationTarget;
use crate::errors::{Result, TestbenchError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Shaping command collaborator used by the container actuator
#[async_trait]
pub trait ShapingCommands: Send + Sync {
    async fn install_or_update_delay(
        &self,
        target: &ActuationTarget,
        delay: Duration,
        jitter: Duration,
        is_first: bool,
    ) -> Result<()>;

    async fn install_or_update_rate(
        &self,
        target: &ActuationTarget,
        rate_bps: u64,
        burst_bytes: u32,
        latency: Duration,
        is_first: bool,
    ) -> Result<()>;
}

fn verb(is_first: bool) -> &'static str {
    if is_first {
        "add"
    } else {
        "change"
    }
}

/// `tc` arguments for the netem delay discipline
pub fn netem_args(interface: &str, delay: Duration, jitter: Duration, is_first: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "qdisc".into(),
        verb(is_first).into(),
        "dev".into(),
        interface.into(),
        "root".into(),
        "handle".into(),
        "1:".into(),
        "netem".into(),
        "delay".into(),
        format!("{}ms", delay.as_millis()),
    ];
    if !jitter.is_zero() {
        args.push(format!("{}ms", jitter.as_millis()));
    }
    args
}

/// `tc` arguments for the tbf rate discipline layered under netem
pub fn tbf_args(
    interface: &str,
    rate_bps: u64,
    burst_bytes: u32,
    latency: Duration,
    is_first: bool,
) -> Vec<String> {
    vec![
        "qdisc".into(),
        verb(is_first).into(),
        "dev".into(),
        interface.into(),
        "parent".into(),
        "1:".into(),
        "handle".into(),
        "2:".into(),
        "tbf".into(),
        "rate".into(),
        format!("{}bit", rate_bps),
        "burst".into(),
        format!("{}b", burst_bytes),
        "latency".into(),
        format!("{}ms", latency.as_millis()),
    ]
}

/// Runs `tc` through `<runtime> exec <container>`
#[derive(Clone, Debug)]
pub struct TcShaper {
    runtime: String,
}

impl TcShaper {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    async fn exec_tc(&self, target: &ActuationTarget, tc_args: Vec<String>) -> Result<()> {
        debug!(
            "Running tc in {}: {}",
            target.container,
            tc_args.join(" ")
        );
        let output = Command::new(&self.runtime)
            .arg("exec")
            .arg(&target.container)
            .arg("tc")
            .args(&tc_args)
            .output()
            .await
            .map_err(|e| {
                TestbenchError::Actuation(format!("failed to run {}: {}", self.runtime, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TestbenchError::Actuation(format!(
                "tc {} in {} exited with {}: {}",
                tc_args.join(" "),
                target.container,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Default for TcShaper {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ShapingCommands for TcShaper {
    async fn install_or_update_delay(
        &self,
        target: &ActuationTarget,
        delay: Duration,
        jitter: Duration,
        is_first: bool,
    ) -> Result<()> {
        self.exec_tc(target, netem_args(&target.interface, delay, jitter, is_first))
            .await
    }

    async fn install_or_update_rate(
        &self,
        target: &ActuationTarget,
        rate_bps: u64,
        burst_bytes: u32,
        latency: Duration,
        is_first: bool,
    ) -> Result<()> {
        self.exec_tc(
            target,
            tbf_args(&target.interface, rate_bps, burst_bytes, latency, is_first),
        )
        .await
    }
}
