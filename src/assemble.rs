//! Wiring a test case into a ready-to-run supervisor
//!
//! The backend is picked here, once, from the test case: router containers
//! shaped with `tc`, or in-process virtual routers with synthetic load.

use crate::actuator::{Actuator, ContainerActuator, VirtualRouterActuator};
use crate::discovery::{DiscoveryConfig, DockerRuntime, RuntimeIntrospection};
use crate::errors::{Result, TestbenchError};
use crate::qdisc::{ShapingCommands, TcShaper};
use crate::ratelog::RateLog;
use crate::runner::LinkRunner;
use crate::supervisor::{SupervisorConfig, TestSupervisor};
use crate::vnet::{LoopbackTraffic, VirtualNetwork, LEFT_ROUTER, RIGHT_ROUTER};
use crate::workload::ComposeWorkload;
use scenarios::{Backend, Implementation, TestCase};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Offered loopback load relative to the reference capacity; above every
/// built-in capacity step
const LOOPBACK_LOAD_FACTOR: u64 = 3;

#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Where `leftrouter.log`, `rightrouter.log` and the workload output go
    pub output_dir: PathBuf,
    /// Directory compose files are resolved against
    pub compose_dir: PathBuf,
    pub container_runtime: String,
    pub compose_executable: String,
    pub discovery: DiscoveryConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            compose_dir: PathBuf::from("."),
            container_runtime: "docker".to_string(),
            compose_executable: "docker-compose".to_string(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl RunOptions {
    pub fn log_path(&self, router: &str) -> PathBuf {
        self.output_dir.join(format!("{}.log", router))
    }
}

/// Build the supervisor for one test case / implementation pair
pub fn supervisor_for(
    case: &TestCase,
    implementation: &Implementation,
    options: &RunOptions,
) -> Result<TestSupervisor> {
    case.validate().map_err(TestbenchError::InvalidConfig)?;
    info!(
        "Assembling {} with {} on the {} backend",
        case.name, implementation.name, case.backend
    );

    let config = SupervisorConfig {
        total_duration: case.duration(),
    };
    let env = implementation.compose_env(&options.output_dir);
    let left_log = RateLog::create(options.log_path(LEFT_ROUTER))?;
    let right_log = RateLog::create(options.log_path(RIGHT_ROUTER))?;

    match case.backend {
        Backend::Container => {
            let compose_file = case.compose_file.as_deref().ok_or_else(|| {
                TestbenchError::InvalidConfig(format!("{}: no compose file", case.name))
            })?;
            let runtime: Arc<dyn RuntimeIntrospection> =
                Arc::new(DockerRuntime::new(options.container_runtime.clone()));
            let shaper: Arc<dyn ShapingCommands> =
                Arc::new(TcShaper::new(options.container_runtime.clone()));
            let actuator = |router: &str| -> Box<dyn Actuator> {
                Box::new(ContainerActuator::new(
                    router,
                    runtime.clone(),
                    shaper.clone(),
                    options.discovery.clone(),
                ))
            };

            TestSupervisor::builder(config)
                .left(LinkRunner::new(LEFT_ROUTER, case.left.clone(), actuator(LEFT_ROUTER), left_log))
                .right(LinkRunner::new(RIGHT_ROUTER, case.right.clone(), actuator(RIGHT_ROUTER), right_log))
                .workload(
                    ComposeWorkload::new(resolve_compose_file(&options.compose_dir, compose_file))
                        .with_executable(options.compose_executable.clone()),
                )
                .env(env)
                .build()
        }
        Backend::VirtualRouter => {
            let network = VirtualNetwork::new(case.reference_capacity_bps);
            let left = VirtualRouterActuator::new(&network.left.limiter(), case.reference_capacity_bps);
            let right = VirtualRouterActuator::new(&network.right.limiter(), case.reference_capacity_bps);
            let traffic = LoopbackTraffic::new(
                network.limiters(),
                case.reference_capacity_bps * LOOPBACK_LOAD_FACTOR,
            );

            TestSupervisor::builder(config)
                .left(LinkRunner::new(LEFT_ROUTER, case.left.clone(), Box::new(left), left_log))
                .right(LinkRunner::new(RIGHT_ROUTER, case.right.clone(), Box::new(right), right_log))
                .workload(traffic)
                .env(env)
                .build()
        }
    }
}

fn resolve_compose_file(dir: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::LinkState;
    use crate::supervisor::RunEnd;
    use scenarios::Schedule;
    use std::time::Duration;

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn compose_paths_resolve_against_directory() {
        assert_eq!(
            resolve_compose_file(Path::new("/srv/bwe"), "1-docker-compose.yml"),
            PathBuf::from("/srv/bwe/1-docker-compose.yml")
        );
        assert_eq!(
            resolve_compose_file(Path::new("/srv/bwe"), "/etc/compose.yml"),
            PathBuf::from("/etc/compose.yml")
        );
    }

    #[test]
    fn invalid_case_is_rejected_before_files_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut case = TestCase::variable_capacity_single_flow();
        case.compose_file = None;
        let err = supervisor_for(&case, &Implementation::pion_gcc(), &options(dir.path()))
            .err()
            .unwrap();
        assert!(matches!(err, TestbenchError::InvalidConfig(_)));
        assert!(!dir.path().join("leftrouter.log").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn virtual_router_case_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut case = TestCase::vnet_congested_feedback_link();
        case.duration_ms = 30_000;
        case.right = Schedule::from_ratios(&[(10, 2.0), (10, 0.8)]);

        let supervisor =
            supervisor_for(&case, &Implementation::pion_gcc(), &options(dir.path())).unwrap();
        let report = supervisor.run(std::future::pending()).await.unwrap();

        assert_eq!(report.ended_by, RunEnd::Deadline);
        assert_eq!(report.elapsed, Duration::from_secs(30));
        assert_eq!(report.left.state, LinkState::Cancelled);
        assert_eq!(report.left.phases_applied, 2);
        assert_eq!(report.right.state, LinkState::Completed);

        let left = std::fs::read_to_string(dir.path().join("leftrouter.log")).unwrap();
        let rates: Vec<u64> = crate::ratelog::parse_entries(&left)
            .iter()
            .map(|e| e.1)
            .collect();
        assert_eq!(rates, vec![2_000_000, 1_000_000, 1_000_000]);
    }
}
