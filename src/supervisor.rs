//! Test supervisor: two links, one deadline, one teardown
//!
//! A run starts the workload, resolves both links' targets concurrently,
//! then runs both schedules on their own tasks while racing the total test
//! duration, external cancellation, link failures and workload exit. The
//! first of those to fire ends the run; both links are cancelled and
//! awaited, and teardown runs exactly once whatever happened.

use crate::actuator::Attachment;
use crate::cancel::{self, CancelHandle, Cancellation};
use crate::errors::{Result, TestbenchError};
use crate::runner::{LinkOutcome, LinkRunner, LinkState};
use crate::workload::{Workload, WorkloadEnv, WorkloadHandle};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Wall-clock length of the run once both links are resolved
    pub total_duration: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            total_duration: Duration::from_secs(120),
        }
    }
}

/// What ended a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Deadline,
    Cancelled,
    WorkloadExited,
    Failed,
}

impl fmt::Display for RunEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunEnd::Deadline => "test duration elapsed",
            RunEnd::Cancelled => "cancelled",
            RunEnd::WorkloadExited => "workload exited",
            RunEnd::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub ended_by: RunEnd,
    pub left: LinkOutcome,
    pub right: LinkOutcome,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl RunReport {
    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn as_millis<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    left: Option<LinkRunner>,
    right: Option<LinkRunner>,
    workload: Option<Box<dyn Workload>>,
    env: WorkloadEnv,
}

impl SupervisorBuilder {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            left: None,
            right: None,
            workload: None,
            env: WorkloadEnv::new(),
        }
    }

    pub fn left(mut self, runner: LinkRunner) -> Self {
        self.left = Some(runner);
        self
    }

    pub fn right(mut self, runner: LinkRunner) -> Self {
        self.right = Some(runner);
        self
    }

    pub fn workload(mut self, workload: impl Workload + 'static) -> Self {
        self.workload = Some(Box::new(workload));
        self
    }

    pub fn env(mut self, env: WorkloadEnv) -> Self {
        self.env = env;
        self
    }

    pub fn build(self) -> Result<TestSupervisor> {
        if self.config.total_duration.is_zero() {
            return Err(TestbenchError::InvalidConfig(
                "total test duration must be non-zero".to_string(),
            ));
        }
        let left = self
            .left
            .ok_or_else(|| TestbenchError::InvalidConfig("left link is missing".to_string()))?;
        let right = self
            .right
            .ok_or_else(|| TestbenchError::InvalidConfig("right link is missing".to_string()))?;
        let workload = self
            .workload
            .ok_or_else(|| TestbenchError::InvalidConfig("workload is missing".to_string()))?;

        Ok(TestSupervisor {
            config: self.config,
            left_name: left.name().to_string(),
            right_name: right.name().to_string(),
            left: Some(left),
            right: Some(right),
            workload,
            env: self.env,
        })
    }
}

pub struct TestSupervisor {
    config: SupervisorConfig,
    left_name: String,
    right_name: String,
    left: Option<LinkRunner>,
    right: Option<LinkRunner>,
    workload: Box<dyn Workload>,
    env: WorkloadEnv,
}

impl TestSupervisor {
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// Run the test until the deadline, `shutdown`, or the first failure
    ///
    /// Returns the first fatal error, otherwise a report of how both links
    /// ended. Teardown failures are logged and never change the result.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<RunReport> {
        let started = Instant::now();
        let mut workload = None;

        let ended = self.execute(&mut workload, shutdown).await;
        self.teardown(workload.take()).await;

        let ended_by = ended?;
        let report = RunReport {
            ended_by,
            left: self.outcome(Side::Left),
            right: self.outcome(Side::Right),
            elapsed: started.elapsed(),
        };
        info!(
            "Run finished ({}): {} {}, {} {}",
            report.ended_by,
            report.left.name,
            report.left.state,
            report.right.name,
            report.right.state
        );
        Ok(report)
    }

    async fn execute(
        &mut self,
        workload: &mut Option<Box<dyn WorkloadHandle>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RunEnd> {
        tokio::pin!(shutdown);

        info!("Starting workload");
        *workload = Some(self.workload.start(&self.env).await?);

        let (cancel, cancellation) = cancel::channel();
        if let Some(ended_by) = self
            .resolve_links(&cancel, &cancellation, shutdown.as_mut(), workload)
            .await?
        {
            return Ok(ended_by);
        }

        let mut tasks = JoinSet::new();
        for (side, runner) in [
            (Side::Left, self.left.take()),
            (Side::Right, self.right.take()),
        ] {
            if let Some(mut runner) = runner {
                let mut cancellation = cancellation.clone();
                tasks.spawn(async move {
                    let result = runner.run(&mut cancellation).await;
                    (side, runner, result)
                });
            }
        }

        let deadline = sleep(self.config.total_duration);
        tokio::pin!(deadline);
        info!("Links running for {:?}", self.config.total_duration);

        let mut first_error = None;
        let ended_by = loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Test duration elapsed");
                    break RunEnd::Deadline;
                }
                _ = shutdown.as_mut() => {
                    info!("Cancellation requested");
                    break RunEnd::Cancelled;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((side, runner, Ok(state))) => {
                            info!("{} finished: {}", runner.name(), state);
                            self.store(side, runner);
                        }
                        Ok((side, runner, Err(e))) => {
                            error!("{} failed ({}): {}", runner.name(), e.kind(), e);
                            self.store(side, runner);
                            first_error = Some(e);
                            break RunEnd::Failed;
                        }
                        Err(e) => {
                            first_error = Some(TestbenchError::Task(e.to_string()));
                            break RunEnd::Failed;
                        }
                    }
                }
                exit = wait_for_exit(workload) => {
                    match exit {
                        Ok(()) => {
                            info!("Workload exited");
                            break RunEnd::WorkloadExited;
                        }
                        Err(e) => {
                            error!("Workload failed ({}): {}", e.kind(), e);
                            first_error = Some(e);
                            break RunEnd::Failed;
                        }
                    }
                }
            }
        };

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((side, runner, result)) => {
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                    self.store(side, runner);
                }
                Err(e) => {
                    first_error.get_or_insert(TestbenchError::Task(e.to_string()));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(ended_by),
        }
    }

    /// Resolve both links concurrently
    ///
    /// Returns what ended the run if shutdown or the workload exiting beat
    /// resolution, `None` once both links are attached. `shutdown` is never
    /// polled again after it fires here.
    async fn resolve_links(
        &mut self,
        cancel: &CancelHandle,
        cancellation: &Cancellation,
        shutdown: std::pin::Pin<&mut impl Future<Output = ()>>,
        workload: &mut Option<Box<dyn WorkloadHandle>>,
    ) -> Result<Option<RunEnd>> {
        let (Some(left), Some(right)) = (self.left.as_mut(), self.right.as_mut()) else {
            return Err(TestbenchError::Task("links already consumed".to_string()));
        };

        let mut left_cancel = cancellation.clone();
        let mut right_cancel = cancellation.clone();
        let both = async {
            tokio::try_join!(left.resolve(&mut left_cancel), right.resolve(&mut right_cancel))
        };
        tokio::pin!(both);

        let interrupted = tokio::select! {
            resolved = &mut both => {
                let resolved = resolved?;
                return Ok(if resolved == (Attachment::Attached, Attachment::Attached) {
                    None
                } else {
                    Some(RunEnd::Cancelled)
                });
            }
            _ = shutdown => {
                info!("Cancellation requested while resolving links");
                Ok(RunEnd::Cancelled)
            }
            exit = wait_for_exit(workload) => match exit {
                Ok(()) => {
                    info!("Workload exited while resolving links");
                    Ok(RunEnd::WorkloadExited)
                }
                Err(e) => {
                    error!("Workload failed while resolving links ({}): {}", e.kind(), e);
                    Err(e)
                }
            },
        };

        // attaches already in flight run to completion; their result no
        // longer decides the outcome
        cancel.cancel();
        if let Err(e) = both.await {
            debug!("Link resolution ended after interruption: {}", e);
        }
        interrupted.map(Some)
    }

    fn store(&mut self, side: Side, runner: LinkRunner) {
        match side {
            Side::Left => self.left = Some(runner),
            Side::Right => self.right = Some(runner),
        }
    }

    fn outcome(&self, side: Side) -> LinkOutcome {
        let (runner, name) = match side {
            Side::Left => (&self.left, &self.left_name),
            Side::Right => (&self.right, &self.right_name),
        };
        runner.as_ref().map(LinkRunner::outcome).unwrap_or_else(|| LinkOutcome {
            name: name.clone(),
            state: LinkState::Failed,
            phases_applied: 0,
        })
    }

    async fn teardown(&mut self, workload: Option<Box<dyn WorkloadHandle>>) {
        info!("Tearing down");
        if let Some(handle) = workload {
            if let Err(e) = handle.stop().await {
                warn!("Failed to stop workload: {}", e);
            }
        }
        for runner in [self.left.as_mut(), self.right.as_mut()].into_iter().flatten() {
            runner.close();
        }
    }
}

async fn wait_for_exit(workload: &mut Option<Box<dyn WorkloadHandle>>) -> Result<()> {
    match workload.as_mut() {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}
