//! Test-subject workload lifecycle
//!
//! The supervisor only needs to start the workload, notice if it exits on
//! its own, and stop it exactly once at teardown.

use crate::errors::{Result, TestbenchError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub type WorkloadEnv = BTreeMap<String, String>;

#[async_trait]
pub trait Workload: Send + Sync {
    async fn start(&self, env: &WorkloadEnv) -> Result<Box<dyn WorkloadHandle>>;
}

#[async_trait]
pub trait WorkloadHandle: Send {
    /// Resolves when the workload exits by itself
    ///
    /// Must be cancel-safe: the supervisor drops this future when another
    /// race branch wins.
    async fn wait(&mut self) -> Result<()>;

    async fn stop(self: Box<Self>) -> Result<()>;
}

/// `docker-compose -f <file> up --force-recreate`, torn down with `down`
#[derive(Clone, Debug)]
pub struct ComposeWorkload {
    executable: String,
    compose_file: PathBuf,
    stop_grace: Duration,
}

impl ComposeWorkload {
    pub fn new(compose_file: impl Into<PathBuf>) -> Self {
        Self {
            executable: "docker-compose".to_string(),
            compose_file: compose_file.into(),
            stop_grace: Duration::from_secs(30),
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }
}

#[async_trait]
impl Workload for ComposeWorkload {
    async fn start(&self, env: &WorkloadEnv) -> Result<Box<dyn WorkloadHandle>> {
        info!(
            "Starting {} -f {} up",
            self.executable,
            self.compose_file.display()
        );
        let child = Command::new(&self.executable)
            .arg("-f")
            .arg(&self.compose_file)
            .args(["up", "--force-recreate"])
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TestbenchError::Workload(format!("failed to start {}: {}", self.executable, e))
            })?;

        Ok(Box::new(ComposeHandle {
            config: self.clone(),
            env: env.clone(),
            child,
            exited: false,
        }))
    }
}

struct ComposeHandle {
    config: ComposeWorkload,
    env: WorkloadEnv,
    child: Child,
    exited: bool,
}

#[async_trait]
impl WorkloadHandle for ComposeHandle {
    async fn wait(&mut self) -> Result<()> {
        if self.exited {
            return std::future::pending().await;
        }
        let status = self.child.wait().await?;
        self.exited = true;
        if status.success() {
            info!("{} up exited cleanly", self.config.executable);
            Ok(())
        } else {
            Err(TestbenchError::Workload(format!(
                "{} up exited with {}",
                self.config.executable, status
            )))
        }
    }

    async fn stop(mut self: Box<Self>) -> Result<()> {
        info!(
            "Stopping {} -f {}",
            self.config.executable,
            self.config.compose_file.display()
        );
        let down = Command::new(&self.config.executable)
            .arg("-f")
            .arg(&self.config.compose_file)
            .arg("down")
            .envs(&self.env)
            .stdin(Stdio::null())
            .output()
            .await;

        let result = match down {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(TestbenchError::Workload(format!(
                "{} down exited with {}: {}",
                self.config.executable,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(e) => Err(TestbenchError::Workload(format!(
                "failed to run {} down: {}",
                self.config.executable, e
            ))),
        };

        if !self.exited {
            match tokio::time::timeout(self.config.stop_grace, self.child.wait()).await {
                Ok(status) => debug!("{} up exited: {:?}", self.config.executable, status),
                Err(_) => {
                    warn!("{} up still running, killing it", self.config.executable);
                    self.child.kill().await?;
                }
            }
        }
        result
    }
}
