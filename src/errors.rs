//! Error types for the testbench core

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestbenchError {
    #[error("Timed out after {timeout:?} waiting for {target}")]
    DiscoveryTimeout { target: String, timeout: Duration },

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Failed to apply impairment: {0}")]
    Actuation(String),

    #[error("Actuator not attached: {0}")]
    NotAttached(String),

    #[error("Workload failed: {0}")]
    Workload(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TestbenchError {
    /// Short classification used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TestbenchError::DiscoveryTimeout { .. } => "discovery_timeout",
            TestbenchError::Discovery(_) => "discovery",
            TestbenchError::Actuation(_) | TestbenchError::NotAttached(_) => "actuation",
            TestbenchError::Workload(_) => "workload",
            TestbenchError::InvalidConfig(_) => "config",
            TestbenchError::Task(_) => "task",
            TestbenchError::Io(_) => "io",
            TestbenchError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, TestbenchError>;
