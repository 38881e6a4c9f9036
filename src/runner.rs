//! Link runner: drives one link's schedule through its actuator
//!
//! States move `Idle -> Resolving -> Running` and end in exactly one of
//! `Completed`, `Cancelled` or `Failed`. Phases are applied strictly in
//! order; cancellation is observed between phases, never during an
//! `apply`.

use crate::actuator::{Actuator, Attachment};
use crate::cancel::Cancellation;
use crate::errors::{Result, TestbenchError};
use crate::ratelog::RateLog;
use scenarios::Schedule;
use serde::Serialize;
use std::fmt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Resolving,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Completed | LinkState::Cancelled | LinkState::Failed
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Resolving => "resolving",
            LinkState::Running => "running",
            LinkState::Completed => "completed",
            LinkState::Cancelled => "cancelled",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final state of one link after a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub name: String,
    pub state: LinkState,
    pub phases_applied: usize,
}

pub struct LinkRunner {
    name: String,
    schedule: Schedule,
    actuator: Box<dyn Actuator>,
    log: RateLog,
    state: LinkState,
    phases_applied: usize,
}

impl LinkRunner {
    pub fn new(
        name: impl Into<String>,
        schedule: Schedule,
        actuator: Box<dyn Actuator>,
        log: RateLog,
    ) -> Self {
        Self {
            name: name.into(),
            schedule,
            actuator,
            log,
            state: LinkState::Idle,
            phases_applied: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn phases_applied(&self) -> usize {
        self.phases_applied
    }

    pub fn outcome(&self) -> LinkOutcome {
        LinkOutcome {
            name: self.name.clone(),
            state: self.state,
            phases_applied: self.phases_applied,
        }
    }

    /// Resolve the actuation target (`Idle -> Resolving`)
    ///
    /// On success the runner stays in `Resolving` until [`LinkRunner::run`]
    /// starts the schedule. Cancellation and failure are terminal.
    pub async fn resolve(&mut self, cancel: &mut Cancellation) -> Result<Attachment> {
        match self.state {
            LinkState::Idle => {}
            LinkState::Resolving => return Ok(Attachment::Attached),
            other => {
                return Err(TestbenchError::Task(format!(
                    "link {} cannot resolve from state {}",
                    self.name, other
                )))
            }
        }

        self.state = LinkState::Resolving;
        debug!("{}: resolving {}", self.name, self.actuator.target_name());
        match self.actuator.attach(cancel).await {
            Ok(Attachment::Attached) => Ok(Attachment::Attached),
            Ok(Attachment::Cancelled) => {
                self.finish(LinkState::Cancelled);
                Ok(Attachment::Cancelled)
            }
            Err(e) => {
                error!("{}: resolving {} failed: {}", self.name, self.actuator.target_name(), e);
                self.finish(LinkState::Failed);
                Err(e)
            }
        }
    }

    /// Run the schedule to a terminal state
    ///
    /// Resolves first if that has not happened yet. The log receives one
    /// entry per applied phase and a terminal entry on the way out.
    pub async fn run(&mut self, cancel: &mut Cancellation) -> Result<LinkState> {
        match self.state {
            LinkState::Idle => {
                if self.resolve(cancel).await? == Attachment::Cancelled {
                    return Ok(self.state);
                }
            }
            LinkState::Resolving => {}
            other => {
                return Err(TestbenchError::Task(format!(
                    "link {} cannot run from state {}",
                    self.name, other
                )))
            }
        }

        self.state = LinkState::Running;
        info!(
            "{}: running {} phase(s) on {}",
            self.name,
            self.schedule.len(),
            self.actuator.target_name()
        );

        match self.run_phases(cancel).await {
            Ok(state) => {
                self.finish(state);
                info!("{}: {} after {} phase(s)", self.name, state, self.phases_applied);
                Ok(state)
            }
            Err(e) => {
                error!("{}: failed after {} phase(s): {}", self.name, self.phases_applied, e);
                self.finish(LinkState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&mut self, cancel: &mut Cancellation) -> Result<LinkState> {
        for (index, phase) in self.schedule.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(LinkState::Cancelled);
            }

            self.actuator.apply(&phase.config, index == 0).await?;
            self.phases_applied += 1;
            self.log.record(self.actuator.applied_rate(&phase.config))?;
            info!("{}: phase {} applied: {}", self.name, index, phase.config);

            if phase.is_terminal() {
                return Ok(LinkState::Completed);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(LinkState::Cancelled),
                _ = sleep(phase.duration()) => {}
            }
        }
        Ok(LinkState::Completed)
    }

    /// Release the runner at teardown
    ///
    /// A runner that never reached a terminal state is marked cancelled.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.finish(LinkState::Cancelled);
        }
    }

    fn finish(&mut self, state: LinkState) {
        self.state = state;
        if let Err(e) = self.log.finish() {
            warn!("{}: failed to close rate log: {}", self.name, e);
        }
    }
}
