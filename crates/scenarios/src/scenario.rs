//! Test case definitions with the reference presets
//!
//! A test case pairs a left-link and a right-link schedule with a total
//! run duration and the backend they are meant to be actuated on.

use crate::impairment::{Backend, Impairment, ShapingSpec};
use crate::schedule::{Phase, Schedule};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference capacity used by the virtual-router cases (1 Mbit/s)
pub const DEFAULT_REFERENCE_CAPACITY_BPS: u64 = 1_000_000;

fn default_reference_capacity() -> u64 {
    DEFAULT_REFERENCE_CAPACITY_BPS
}

/// One complete test run description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backend: Backend,
    /// Compose file bringing up routers and test subjects (container backend)
    #[serde(default, alias = "dc_file", skip_serializing_if = "Option::is_none")]
    pub compose_file: Option<String>,
    /// Total run time; the run is cancelled once it elapses
    pub duration_ms: u64,
    /// Capacity that relative phases are multiplied against
    #[serde(default = "default_reference_capacity")]
    pub reference_capacity_bps: u64,
    #[serde(default, alias = "leftrouter")]
    pub left: Schedule,
    #[serde(default, alias = "rightrouter")]
    pub right: Schedule,
}

impl TestCase {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Check the case can be run on its backend
    pub fn validate(&self) -> Result<(), String> {
        if self.duration_ms == 0 {
            return Err(format!("test case '{}': duration must be non-zero", self.name));
        }
        match self.backend {
            Backend::Container => {
                if self.compose_file.as_deref().map_or(true, str::is_empty) {
                    return Err(format!(
                        "test case '{}': container backend requires a compose file",
                        self.name
                    ));
                }
            }
            Backend::VirtualRouter => {
                if self.reference_capacity_bps == 0 {
                    return Err(format!(
                        "test case '{}': reference capacity must be non-zero",
                        self.name
                    ));
                }
            }
        }
        self.left
            .validate(self.backend)
            .map_err(|e| format!("test case '{}', left link: {}", self.name, e))?;
        self.right
            .validate(self.backend)
            .map_err(|e| format!("test case '{}', right link: {}", self.name, e))?;
        Ok(())
    }

    /// Single flow across router containers with a stepped capacity profile
    pub fn variable_capacity_single_flow() -> Self {
        let steps = || {
            let mut phases: Vec<Phase> = [(40, 1_000_000), (20, 2_500_000), (20, 600_000), (20, 1_000_000)]
                .iter()
                .map(|&(secs, rate)| {
                    Phase::new(
                        Duration::from_secs(secs),
                        Impairment::absolute(ShapingSpec::reference(rate)),
                    )
                })
                .collect();
            phases.push(Phase::terminal(Impairment::absolute(
                ShapingSpec::reference(1_000_000),
            )));
            Schedule::new(phases)
        };

        Self {
            name: "VariableAvailableCapacitySingleFlow".to_string(),
            description: "Single media flow over a link whose capacity steps 1 -> 2.5 -> 0.6 -> 1 Mbit/s"
                .to_string(),
            backend: Backend::Container,
            compose_file: Some("1-docker-compose.yml".to_string()),
            duration_ms: 120_000,
            reference_capacity_bps: DEFAULT_REFERENCE_CAPACITY_BPS,
            left: steps(),
            right: steps(),
        }
    }

    /// Virtual-router variant of the single flow case
    pub fn vnet_variable_capacity_single_flow() -> Self {
        Self::vnet(
            "VnetVariableAvailableCapacitySingleFlow",
            "Single flow, forward capacity steps 1 -> 2.5 -> 0.6 -> 1 x reference",
            100,
            DEFAULT_REFERENCE_CAPACITY_BPS,
            Schedule::from_ratios(&[(40, 1.0), (20, 2.5), (20, 0.6), (20, 1.0)]),
            Schedule::empty(),
        )
    }

    /// Two flows sharing a forward link with five capacity steps
    pub fn vnet_variable_capacity_multiple_flow() -> Self {
        Self::vnet(
            "VnetVariableAvailableCapacityMultipleFlow",
            "Two flows sharing a forward link stepping 2 -> 1 -> 1.75 -> 0.5 -> 1 x reference",
            125,
            DEFAULT_REFERENCE_CAPACITY_BPS,
            Schedule::from_ratios(&[(25, 2.0), (25, 1.0), (25, 1.75), (25, 0.5), (25, 1.0)]),
            Schedule::empty(),
        )
    }

    /// Bidirectional flows with a congested feedback path
    pub fn vnet_congested_feedback_link() -> Self {
        Self::vnet(
            "VnetCongestedFeedbackLinkWithBiDirectionalMediaFlows",
            "Media in both directions; the backward link congests independently",
            100,
            DEFAULT_REFERENCE_CAPACITY_BPS,
            Schedule::from_ratios(&[(20, 2.0), (20, 1.0), (20, 0.5), (40, 2.0)]),
            Schedule::from_ratios(&[(35, 2.0), (35, 0.8), (30, 2.0)]),
        )
    }

    /// Three flows with different RTTs on a fixed 4 Mbit/s bottleneck
    pub fn vnet_round_trip_time_fairness() -> Self {
        Self::vnet(
            "VnetRoundTripTimeFairness",
            "Three competing flows on a constant 4 Mbit/s bottleneck",
            300,
            4 * DEFAULT_REFERENCE_CAPACITY_BPS,
            Schedule::empty(),
            Schedule::empty(),
        )
    }

    fn vnet(
        name: &str,
        description: &str,
        duration_secs: u64,
        reference_capacity_bps: u64,
        left: Schedule,
        right: Schedule,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            backend: Backend::VirtualRouter,
            compose_file: None,
            duration_ms: duration_secs * 1000,
            reference_capacity_bps,
            left,
            right,
        }
    }
}
