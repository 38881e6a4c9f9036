//! Network conditions applied for the lifetime of one phase
//!
//! Two encodings exist: an absolute one (explicit delay/rate/burst/latency,
//! consumed by `tc` inside a router container) and a relative one (a ratio
//! applied to a reference capacity, consumed by the in-process virtual
//! router).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which network primitive a test case is driven against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Router containers shaped with `tc` via the container runtime
    #[default]
    Container,
    /// In-process token-bucket routers
    #[serde(alias = "vnet")]
    VirtualRouter,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Container => write!(f, "container"),
            Backend::VirtualRouter => write!(f, "vnet"),
        }
    }
}

/// Absolute shaping parameters (netem delay + tbf rate)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShapingSpec {
    /// One-way delay added by netem
    pub delay_ms: u32,
    /// Delay variation added by netem
    #[serde(default)]
    pub jitter_ms: u32,
    /// Token bucket rate in bits per second
    pub rate_bps: u64,
    /// Token bucket size in bytes
    pub burst_bytes: u32,
    /// Maximum time a packet may wait in the token bucket
    pub latency_ms: u32,
}

impl ShapingSpec {
    /// Delay profile used by the reference container test cases
    pub fn reference(rate_bps: u64) -> Self {
        Self {
            delay_ms: 50,
            jitter_ms: 30,
            rate_bps,
            burst_bytes: 20 * 1024,
            latency_ms: 300,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rate_bps == 0 {
            return Err("rate_bps must be greater than zero".to_string());
        }
        if self.burst_bytes == 0 {
            return Err("burst_bytes must be greater than zero".to_string());
        }
        if self.latency_ms == 0 {
            return Err("latency_ms must be greater than zero".to_string());
        }
        if self.jitter_ms > self.delay_ms {
            return Err(format!(
                "jitter_ms ({}) cannot exceed delay_ms ({})",
                self.jitter_ms, self.delay_ms
            ));
        }
        Ok(())
    }
}

/// Capacity expressed relative to a test case's reference capacity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacitySpec {
    pub capacity_ratio: f64,
}

impl CapacitySpec {
    pub fn validate(&self) -> Result<(), String> {
        if !self.capacity_ratio.is_finite() || self.capacity_ratio <= 0.0 {
            return Err(format!(
                "capacity_ratio must be a positive number, got {}",
                self.capacity_ratio
            ));
        }
        Ok(())
    }
}

/// The network condition that should hold for the duration of a phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Impairment {
    Absolute(ShapingSpec),
    Relative(CapacitySpec),
}

impl Impairment {
    pub fn absolute(spec: ShapingSpec) -> Self {
        Impairment::Absolute(spec)
    }

    pub fn ratio(capacity_ratio: f64) -> Self {
        Impairment::Relative(CapacitySpec { capacity_ratio })
    }

    /// Effective rate in bits per second given the reference capacity.
    ///
    /// Absolute specs ignore the reference; relative specs are truncated
    /// to whole bits per second.
    pub fn rate_bps(&self, reference_capacity_bps: u64) -> u64 {
        match self {
            Impairment::Absolute(spec) => spec.rate_bps,
            Impairment::Relative(spec) => {
                (reference_capacity_bps as f64 * spec.capacity_ratio) as u64
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Impairment::Absolute(spec) => spec.validate(),
            Impairment::Relative(spec) => spec.validate(),
        }
    }

    /// Whether a backend knows how to actuate this encoding
    pub fn supported_by(&self, backend: Backend) -> bool {
        match (self, backend) {
            (Impairment::Relative(_), Backend::Container) => false,
            _ => true,
        }
    }
}

impl fmt::Display for Impairment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Impairment::Absolute(s) => write!(
                f,
                "delay={}ms jitter={}ms rate={}bit burst={}b latency={}ms",
                s.delay_ms, s.jitter_ms, s.rate_bps, s.burst_bytes, s.latency_ms
            ),
            Impairment::Relative(s) => write!(f, "capacity_ratio={}", s.capacity_ratio),
        }
    }
}
