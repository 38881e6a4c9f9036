//! Phased impairment schedules for a single link
//!
//! A schedule is an ordered list of phases. Each phase holds its condition
//! for `duration_ms`; a phase with zero duration is terminal: it is applied
//! and the schedule never advances past it.

use crate::impairment::{Backend, Impairment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A timed network-condition setting within a schedule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// How long the condition holds; zero means "apply and stop advancing"
    pub duration_ms: u64,
    pub config: Impairment,
}

impl Phase {
    pub fn new(duration: Duration, config: Impairment) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            config,
        }
    }

    /// Terminal phase: applied once, never advanced past
    pub fn terminal(config: Impairment) -> Self {
        Self {
            duration_ms: 0,
            config,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.duration_ms == 0
    }
}

/// Ordered sequence of phases for one link
///
/// Empty schedules are legal and leave the link at whatever condition the
/// actuator starts with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    phases: Vec<Phase>,
}

impl Schedule {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a capacity-ratio schedule from `(seconds, ratio)` pairs
    pub fn from_ratios(steps: &[(u64, f64)]) -> Self {
        Self::new(
            steps
                .iter()
                .map(|&(secs, ratio)| Phase::new(Duration::from_secs(secs), Impairment::ratio(ratio)))
                .collect(),
        )
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Phase> {
        self.phases.iter()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Time until the schedule stops advancing
    ///
    /// Phases after a terminal phase are unreachable and do not count.
    pub fn active_duration(&self) -> Duration {
        let mut total = Duration::ZERO;
        for phase in &self.phases {
            if phase.is_terminal() {
                break;
            }
            total += phase.duration();
        }
        total
    }

    pub fn validate(&self, backend: Backend) -> Result<(), String> {
        for (index, phase) in self.phases.iter().enumerate() {
            phase
                .config
                .validate()
                .map_err(|e| format!("phase {}: {}", index, e))?;
            if !phase.config.supported_by(backend) {
                return Err(format!(
                    "phase {}: {} is not supported by the {} backend",
                    index, phase.config, backend
                ));
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Schedule {
    type Item = &'a Phase;
    type IntoIter = std::slice::Iter<'a, Phase>;

    fn into_iter(self) -> Self::IntoIter {
        self.phases.iter()
    }
}

impl From<Vec<Phase>> for Schedule {
    fn from(phases: Vec<Phase>) -> Self {
        Self::new(phases)
    }
}
