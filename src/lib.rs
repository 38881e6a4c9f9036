//! Phased network-impairment scheduler and test-run supervisor
//!
//! Drives two emulated links (left and right) through scripted sequences
//! of bandwidth/delay phases while a bandwidth-estimation test subject runs
//! across them, and supervises the run against a deadline, external
//! cancellation and failures.
//!
//! ```text
//! TestSupervisor -> LinkRunner (x2) -> Actuator -> tc / RateLimiter
//!                                   -> RateLog
//! ```

pub mod actuator;
pub mod assemble;
pub mod cancel;
pub mod discovery;
pub mod errors;
pub mod qdisc;
pub mod ratelog;
pub mod runner;
pub mod supervisor;
pub mod testing;
pub mod vnet;
pub mod workload;

pub use actuator::{Actuator, Attachment, ContainerActuator, VirtualRouterActuator};
pub use assemble::{supervisor_for, RunOptions};
pub use cancel::{CancelHandle, Cancellation};
pub use discovery::{ActuationTarget, DiscoveryConfig, DockerRuntime, RuntimeIntrospection};
pub use errors::{Result, TestbenchError};
pub use qdisc::{ShapingCommands, TcShaper};
pub use ratelog::RateLog;
pub use runner::{LinkOutcome, LinkRunner, LinkState};
pub use supervisor::{RunEnd, RunReport, SupervisorBuilder, SupervisorConfig, TestSupervisor};
pub use vnet::{LoopbackTraffic, RateLimiter, VirtualNetwork, VirtualRouter};
pub use workload::{ComposeWorkload, Workload, WorkloadEnv, WorkloadHandle};

pub use scenarios;
