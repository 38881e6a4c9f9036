//! Test case definitions and presets for the bandwidth-estimation testbench
//!
//! This crate provides the static data a test run is built from: phased
//! impairment schedules for the left and right links, the test cases that
//! pair them with a run duration, and the sender/receiver implementations
//! under test. Everything is collected in an explicitly constructed
//! [`Registry`].

pub mod builder;
pub mod impairment;
pub mod implementation;
pub mod registry;
pub mod scenario;
pub mod schedule;

pub use builder::TestCaseBuilder;
pub use impairment::{Backend, CapacitySpec, Impairment, ShapingSpec};
pub use implementation::{Endpoint, Implementation};
pub use registry::Registry;
pub use scenario::{TestCase, DEFAULT_REFERENCE_CAPACITY_BPS};
pub use schedule::{Phase, Schedule};
