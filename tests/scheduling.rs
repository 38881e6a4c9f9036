//! End-to-end behavior of schedules, link runners and the supervisor
//!
//! Everything runs with paused tokio time against the recording stand-ins
//! in `bwe_testbench::testing`, so no container runtime is needed.

use bwe_testbench::cancel;
use bwe_testbench::discovery::DiscoveryConfig;
use bwe_testbench::ratelog::parse_entries;
use bwe_testbench::testing::{
    RecordingActuator, SharedBuffer, ShapingCall, StubRuntime, StubShaper, StubWorkload,
};
use bwe_testbench::{
    ContainerActuator, LinkRunner, LinkState, RateLog, RunEnd, SupervisorConfig, TestSupervisor,
    TestbenchError,
};
use scenarios::{Impairment, Phase, Schedule, ShapingSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(total: Duration) -> SupervisorConfig {
    SupervisorConfig {
        total_duration: total,
    }
}

#[tokio::test(start_paused = true)]
async fn phases_are_applied_in_order_and_held_for_their_duration() {
    init_logging();
    let (actuator, recorder) = RecordingActuator::new("leftrouter");
    let buffer = SharedBuffer::default();
    let mut runner = LinkRunner::new(
        "leftrouter",
        Schedule::from_ratios(&[(40, 1.0), (20, 2.5), (20, 0.6), (20, 1.0)]),
        Box::new(actuator),
        RateLog::from_writer(buffer.clone()),
    );

    let started = Instant::now();
    let state = runner.run(&mut cancel::Cancellation::never()).await.unwrap();
    assert_eq!(state, LinkState::Completed);
    assert_eq!(started.elapsed(), Duration::from_secs(100));

    let applications = recorder.applications();
    assert_eq!(applications.len(), 4);
    let gaps: Vec<Duration> = applications
        .windows(2)
        .map(|w| w[1].at - w[0].at)
        .collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(40),
            Duration::from_secs(20),
            Duration::from_secs(20)
        ]
    );
    assert_eq!(
        recorder.rates(1_000_000),
        vec![1_000_000, 2_500_000, 600_000, 1_000_000]
    );

    let rates: Vec<u64> = parse_entries(&buffer.contents())
        .into_iter()
        .map(|(_, rate)| rate)
        .collect();
    assert_eq!(rates, vec![1_000_000, 2_500_000, 600_000, 1_000_000, 1_000_000]);
}

#[tokio::test(start_paused = true)]
async fn only_the_first_application_installs() {
    init_logging();
    let (actuator, recorder) = RecordingActuator::new("rightrouter");
    let mut runner = LinkRunner::new(
        "rightrouter",
        Schedule::from_ratios(&[(1, 1.0), (1, 0.5), (1, 2.0)]),
        Box::new(actuator),
        RateLog::discard(),
    );
    runner.run(&mut cancel::Cancellation::never()).await.unwrap();

    let first: Vec<bool> = recorder.applications().iter().map(|a| a.is_first).collect();
    assert_eq!(first, vec![true, false, false]);
}

#[tokio::test(start_paused = true)]
async fn terminal_phase_completes_without_waiting() {
    init_logging();
    let (actuator, recorder) = RecordingActuator::new("leftrouter");
    let mut runner = LinkRunner::new(
        "leftrouter",
        Schedule::new(vec![
            Phase::terminal(Impairment::ratio(0.5)),
            Phase::new(Duration::from_secs(10), Impairment::ratio(2.0)),
        ]),
        Box::new(actuator),
        RateLog::discard(),
    );

    let started = Instant::now();
    let state = runner.run(&mut cancel::Cancellation::never()).await.unwrap();
    assert_eq!(state, LinkState::Completed);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(recorder.applications().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn two_links_advance_concurrently() {
    init_logging();
    let (left, left_rec) = RecordingActuator::new("leftrouter");
    let (right, right_rec) = RecordingActuator::new("rightrouter");
    let (workload, _probe) = StubWorkload::new();

    let supervisor = TestSupervisor::builder(config(Duration::from_secs(60)))
        .left(LinkRunner::new(
            "leftrouter",
            Schedule::from_ratios(&[(10, 1.0), (10, 2.0), (10, 1.0)]),
            Box::new(left),
            RateLog::discard(),
        ))
        .right(LinkRunner::new(
            "rightrouter",
            Schedule::from_ratios(&[(15, 0.5), (15, 1.5)]),
            Box::new(right),
            RateLog::discard(),
        ))
        .workload(workload)
        .build()
        .unwrap();

    let started = Instant::now();
    let report = supervisor.run(std::future::pending()).await.unwrap();
    assert_eq!(report.ended_by, RunEnd::Deadline);

    let offsets = |rec: &bwe_testbench::testing::Recorder| -> Vec<u64> {
        rec.applications()
            .iter()
            .map(|a| (a.at - started).as_secs())
            .collect()
    };
    // neither link waited for the other one's schedule
    assert_eq!(offsets(&left_rec), vec![0, 10, 20]);
    assert_eq!(offsets(&right_rec), vec![0, 15]);
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_a_long_phase() {
    init_logging();
    let (left, left_rec) = RecordingActuator::new("leftrouter");
    let (right, _) = RecordingActuator::new("rightrouter");
    let (workload, probe) = StubWorkload::new();
    let left_log = SharedBuffer::default();

    let supervisor = TestSupervisor::builder(config(Duration::from_secs(5)))
        .left(LinkRunner::new(
            "leftrouter",
            Schedule::from_ratios(&[(100, 1.0), (10, 2.0)]),
            Box::new(left),
            RateLog::from_writer(left_log.clone()),
        ))
        .right(LinkRunner::new(
            "rightrouter",
            Schedule::empty(),
            Box::new(right),
            RateLog::discard(),
        ))
        .workload(workload)
        .build()
        .unwrap();

    let report = supervisor.run(std::future::pending()).await.unwrap();
    assert_eq!(report.ended_by, RunEnd::Deadline);
    assert_eq!(report.elapsed, Duration::from_secs(5));
    assert_eq!(report.left.state, LinkState::Cancelled);
    assert_eq!(report.left.phases_applied, 1);
    assert_eq!(report.right.state, LinkState::Completed);
    assert_eq!(left_rec.applications().len(), 1);
    assert_eq!(parse_entries(&left_log.contents()).len(), 2);
    assert_eq!(probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_signal_ends_run_early() {
    init_logging();
    let (left, _) = RecordingActuator::new("leftrouter");
    let (right, _) = RecordingActuator::new("rightrouter");
    let (workload, probe) = StubWorkload::new();

    let supervisor = TestSupervisor::builder(config(Duration::from_secs(120)))
        .left(LinkRunner::new(
            "leftrouter",
            Schedule::from_ratios(&[(60, 1.0), (60, 2.0)]),
            Box::new(left),
            RateLog::discard(),
        ))
        .right(LinkRunner::new(
            "rightrouter",
            Schedule::from_ratios(&[(60, 1.0)]),
            Box::new(right),
            RateLog::discard(),
        ))
        .workload(workload)
        .build()
        .unwrap();

    let report = supervisor
        .run(tokio::time::sleep(Duration::from_secs(7)))
        .await
        .unwrap();
    assert_eq!(report.ended_by, RunEnd::Cancelled);
    assert_eq!(report.elapsed, Duration::from_secs(7));
    assert_eq!(report.left.state, LinkState::Cancelled);
    assert_eq!(report.right.state, LinkState::Cancelled);
    assert_eq!(probe.starts(), 1);
    assert_eq!(probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_fails_without_touching_the_link() {
    init_logging();
    let runtime = Arc::new(StubRuntime::new("eth1"));
    let shaper = Arc::new(StubShaper::default());
    let discovery = DiscoveryConfig {
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let actuator = |name: &str| {
        Box::new(ContainerActuator::new(
            name,
            runtime.clone(),
            shaper.clone(),
            discovery.clone(),
        ))
    };
    let spec = ShapingSpec::reference(1_000_000);
    let schedule = Schedule::new(vec![Phase::terminal(Impairment::absolute(spec))]);
    let (workload, probe) = StubWorkload::new();

    let supervisor = TestSupervisor::builder(config(Duration::from_secs(60)))
        .left(LinkRunner::new(
            "leftrouter",
            schedule.clone(),
            actuator("leftrouter"),
            RateLog::discard(),
        ))
        .right(LinkRunner::new(
            "rightrouter",
            schedule,
            actuator("rightrouter"),
            RateLog::discard(),
        ))
        .workload(workload)
        .build()
        .unwrap();

    let err = supervisor.run(std::future::pending()).await.unwrap_err();
    assert!(matches!(err, TestbenchError::DiscoveryTimeout { .. }));
    assert!(shaper.calls().is_empty());
    assert!(runtime.polls() > 1);
    assert_eq!(probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn container_link_shapes_delay_then_rate() {
    init_logging();
    let runtime = Arc::new(StubRuntime::new("eth1"));
    runtime.appear_after_polls("leftrouter", 2, vec!["172.25.0.3".parse().unwrap()]);
    let shaper = Arc::new(StubShaper::default());

    let mut runner = LinkRunner::new(
        "leftrouter",
        Schedule::new(vec![
            Phase::new(
                Duration::from_secs(40),
                Impairment::absolute(ShapingSpec::reference(1_000_000)),
            ),
            Phase::terminal(Impairment::absolute(ShapingSpec::reference(2_500_000))),
        ]),
        Box::new(ContainerActuator::new(
            "leftrouter",
            runtime.clone(),
            shaper.clone(),
            DiscoveryConfig::default(),
        )),
        RateLog::discard(),
    );

    let state = runner.run(&mut cancel::Cancellation::never()).await.unwrap();
    assert_eq!(state, LinkState::Completed);
    assert_eq!(runtime.polls(), 3);

    let calls = shaper.calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls[0], ShapingCall::Delay { is_first: true, .. }));
    assert!(matches!(
        calls[1],
        ShapingCall::Rate { rate_bps: 1_000_000, is_first: true, .. }
    ));
    assert!(matches!(calls[2], ShapingCall::Delay { is_first: false, .. }));
    assert!(matches!(
        calls[3],
        ShapingCall::Rate { rate_bps: 2_500_000, is_first: false, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn teardown_runs_once_on_every_exit_path() {
    init_logging();

    // deadline
    let (left, _) = RecordingActuator::new("leftrouter");
    let (right, _) = RecordingActuator::new("rightrouter");
    let (workload, probe) = StubWorkload::new();
    TestSupervisor::builder(config(Duration::from_secs(3)))
        .left(LinkRunner::new("leftrouter", Schedule::from_ratios(&[(10, 1.0)]), Box::new(left), RateLog::discard()))
        .right(LinkRunner::new("rightrouter", Schedule::empty(), Box::new(right), RateLog::discard()))
        .workload(workload)
        .build()
        .unwrap()
        .run(std::future::pending())
        .await
        .unwrap();
    assert_eq!((probe.starts(), probe.stops()), (1, 1));

    // link failure
    let (left, _) = RecordingActuator::new("leftrouter");
    let (right, _) = RecordingActuator::new("rightrouter");
    let (workload, probe) = StubWorkload::new();
    let result = TestSupervisor::builder(config(Duration::from_secs(30)))
        .left(LinkRunner::new("leftrouter", Schedule::from_ratios(&[(1, 1.0), (1, 2.0)]), Box::new(left.failing_at(1)), RateLog::discard()))
        .right(LinkRunner::new("rightrouter", Schedule::empty(), Box::new(right), RateLog::discard()))
        .workload(workload)
        .build()
        .unwrap()
        .run(std::future::pending())
        .await;
    assert!(result.is_err());
    assert_eq!((probe.starts(), probe.stops()), (1, 1));

    // external cancel during resolution
    let (left, _) = RecordingActuator::new("leftrouter");
    let (right, _) = RecordingActuator::new("rightrouter");
    let (workload, probe) = StubWorkload::new();
    let report = TestSupervisor::builder(config(Duration::from_secs(30)))
        .left(LinkRunner::new("leftrouter", Schedule::from_ratios(&[(1, 1.0)]), Box::new(left.attach_after(Duration::from_secs(10))), RateLog::discard()))
        .right(LinkRunner::new("rightrouter", Schedule::empty(), Box::new(right), RateLog::discard()))
        .workload(workload)
        .build()
        .unwrap()
        .run(tokio::time::sleep(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(report.ended_by, RunEnd::Cancelled);
    assert_eq!((probe.starts(), probe.stops()), (1, 1));
}
