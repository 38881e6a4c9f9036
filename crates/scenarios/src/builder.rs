//! Builder pattern for creating custom test cases
//!
//! This module provides TestCaseBuilder for constructing TestCase
//! instances with a fluent API.

use crate::impairment::Backend;
use crate::scenario::{TestCase, DEFAULT_REFERENCE_CAPACITY_BPS};
use crate::schedule::{Phase, Schedule};
use std::time::Duration;

pub struct TestCaseBuilder {
    name: String,
    description: String,
    backend: Backend,
    compose_file: Option<String>,
    duration: Duration,
    reference_capacity_bps: u64,
    left: Vec<Phase>,
    right: Vec<Phase>,
}

impl TestCaseBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            backend: Backend::default(),
            compose_file: None,
            duration: Duration::from_secs(60),
            reference_capacity_bps: DEFAULT_REFERENCE_CAPACITY_BPS,
            left: Vec::new(),
            right: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn compose_file(mut self, file: impl Into<String>) -> Self {
        self.compose_file = Some(file.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn reference_capacity(mut self, bps: u64) -> Self {
        self.reference_capacity_bps = bps;
        self
    }

    pub fn left_phase(mut self, phase: Phase) -> Self {
        self.left.push(phase);
        self
    }

    pub fn right_phase(mut self, phase: Phase) -> Self {
        self.right.push(phase);
        self
    }

    pub fn build(self) -> TestCase {
        TestCase {
            name: self.name,
            description: self.description,
            backend: self.backend,
            compose_file: self.compose_file,
            duration_ms: self.duration.as_millis() as u64,
            reference_capacity_bps: self.reference_capacity_bps,
            left: Schedule::new(self.left),
            right: Schedule::new(self.right),
        }
    }
}
