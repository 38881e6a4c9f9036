//! Testing utilities: recording stand-ins for every collaborator
//!
//! These let link runners and the supervisor be driven with paused tokio
//! time and no container runtime.

use crate::actuator::{Actuator, Attachment};
use crate::cancel::Cancellation;
use crate::discovery::{ActuationTarget, RunningWorkload, RuntimeIntrospection};
use crate::errors::{Result, TestbenchError};
use crate::qdisc::ShapingCommands;
use crate::workload::{Workload, WorkloadEnv, WorkloadHandle};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use scenarios::Impairment;
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// In-memory writer whose contents stay readable after the log is moved
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Container runtime whose workloads appear after a set number of polls
pub struct StubRuntime {
    interface: String,
    polls: AtomicUsize,
    workloads: Mutex<Vec<(String, usize, Vec<IpAddr>)>>,
}

impl StubRuntime {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            polls: AtomicUsize::new(0),
            workloads: Mutex::new(Vec::new()),
        }
    }

    /// `name` is missing from the first `polls` listings
    pub fn appear_after_polls(&self, name: &str, polls: usize, addresses: Vec<IpAddr>) {
        self.workloads
            .lock()
            .push((name.to_string(), polls, addresses));
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeIntrospection for StubRuntime {
    async fn list_running_workloads(&self) -> Result<Vec<RunningWorkload>> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self
            .workloads
            .lock()
            .iter()
            .filter(|(_, after, _)| poll > *after)
            .map(|(name, _, addresses)| RunningWorkload {
                name: name.clone(),
                addresses: addresses.clone(),
            })
            .collect())
    }

    async fn interface_for_prefix(
        &self,
        _workload: &str,
        _prefix: &IpNetwork,
    ) -> Result<Option<String>> {
        Ok(Some(self.interface.clone()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShapingCall {
    Delay {
        target: ActuationTarget,
        delay: Duration,
        jitter: Duration,
        is_first: bool,
    },
    Rate {
        target: ActuationTarget,
        rate_bps: u64,
        burst_bytes: u32,
        latency: Duration,
        is_first: bool,
    },
}

/// Records shaping commands instead of running `tc`
#[derive(Default)]
pub struct StubShaper {
    calls: Mutex<Vec<ShapingCall>>,
    fail_rate: AtomicBool,
}

impl StubShaper {
    pub fn fail_rate_updates(&self) {
        self.fail_rate.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ShapingCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ShapingCommands for StubShaper {
    async fn install_or_update_delay(
        &self,
        target: &ActuationTarget,
        delay: Duration,
        jitter: Duration,
        is_first: bool,
    ) -> Result<()> {
        self.calls.lock().push(ShapingCall::Delay {
            target: target.clone(),
            delay,
            jitter,
            is_first,
        });
        Ok(())
    }

    async fn install_or_update_rate(
        &self,
        target: &ActuationTarget,
        rate_bps: u64,
        burst_bytes: u32,
        latency: Duration,
        is_first: bool,
    ) -> Result<()> {
        if self.fail_rate.load(Ordering::SeqCst) {
            return Err(TestbenchError::Actuation(format!(
                "tbf rejected on {}",
                target
            )));
        }
        self.calls.lock().push(ShapingCall::Rate {
            target: target.clone(),
            rate_bps,
            burst_bytes,
            latency,
            is_first,
        });
        Ok(())
    }
}

/// One `apply` seen by a [`RecordingActuator`]
#[derive(Clone, Debug)]
pub struct Application {
    pub config: Impairment,
    pub is_first: bool,
    pub at: Instant,
}

/// Read side of a [`RecordingActuator`], usable after the actuator moved
#[derive(Clone, Default)]
pub struct Recorder {
    applications: Arc<Mutex<Vec<Application>>>,
    attach_calls: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn applications(&self) -> Vec<Application> {
        self.applications.lock().clone()
    }

    pub fn rates(&self, reference_capacity_bps: u64) -> Vec<u64> {
        self.applications
            .lock()
            .iter()
            .map(|a| a.config.rate_bps(reference_capacity_bps))
            .collect()
    }

    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }
}

/// Actuator that records every call and can be told to fail
pub struct RecordingActuator {
    name: String,
    recorder: Recorder,
    attach_delay: Duration,
    attach_ignores_cancel: bool,
    attach_error: Option<String>,
    fail_at: Option<usize>,
    reference_capacity_bps: u64,
}

impl RecordingActuator {
    pub fn new(name: impl Into<String>) -> (Self, Recorder) {
        let recorder = Recorder::default();
        (
            Self {
                name: name.into(),
                recorder: recorder.clone(),
                attach_delay: Duration::ZERO,
                attach_ignores_cancel: false,
                attach_error: None,
                fail_at: None,
                reference_capacity_bps: 1_000_000,
            },
            recorder,
        )
    }

    /// Fail the `index`-th `apply` (0-based)
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn failing_attach(mut self, message: impl Into<String>) -> Self {
        self.attach_error = Some(message.into());
        self
    }

    pub fn attach_after(mut self, delay: Duration) -> Self {
        self.attach_delay = delay;
        self
    }

    /// Finish the attach delay even if cancelled meanwhile, like a
    /// runtime command that is already running
    pub fn ignoring_cancellation(mut self) -> Self {
        self.attach_ignores_cancel = true;
        self
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn attach(&mut self, cancel: &mut Cancellation) -> Result<Attachment> {
        self.recorder.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.attach_ignores_cancel {
            sleep(self.attach_delay).await;
        } else if !self.attach_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Attachment::Cancelled),
                _ = sleep(self.attach_delay) => {}
            }
        }
        match &self.attach_error {
            Some(message) => Err(TestbenchError::Discovery(message.clone())),
            None => Ok(Attachment::Attached),
        }
    }

    async fn apply(&mut self, config: &Impairment, is_first: bool) -> Result<()> {
        let mut applications = self.recorder.applications.lock();
        if self.fail_at == Some(applications.len()) {
            return Err(TestbenchError::Actuation(format!(
                "{}: injected failure",
                self.name
            )));
        }
        applications.push(Application {
            config: config.clone(),
            is_first,
            at: Instant::now(),
        });
        Ok(())
    }

    fn applied_rate(&self, config: &Impairment) -> u64 {
        config.rate_bps(self.reference_capacity_bps)
    }

    fn target_name(&self) -> &str {
        &self.name
    }
}

/// Read side of a [`StubWorkload`]
#[derive(Clone, Default)]
pub struct WorkloadProbe {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    env: Arc<Mutex<Option<WorkloadEnv>>>,
}

impl WorkloadProbe {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn env(&self) -> Option<WorkloadEnv> {
        self.env.lock().clone()
    }
}

/// Workload that counts starts and stops
#[derive(Default)]
pub struct StubWorkload {
    probe: WorkloadProbe,
    fail_start: bool,
    fail_stop: bool,
    exit: Option<(Duration, bool)>,
}

impl StubWorkload {
    pub fn new() -> (Self, WorkloadProbe) {
        let workload = Self::default();
        let probe = workload.probe.clone();
        (workload, probe)
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Exit on its own after `after`, cleanly or not
    pub fn exiting_after(mut self, after: Duration, clean: bool) -> Self {
        self.exit = Some((after, clean));
        self
    }
}

#[async_trait]
impl Workload for StubWorkload {
    async fn start(&self, env: &WorkloadEnv) -> Result<Box<dyn WorkloadHandle>> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        *self.probe.env.lock() = Some(env.clone());
        if self.fail_start {
            return Err(TestbenchError::Workload("injected start failure".to_string()));
        }
        Ok(Box::new(StubHandle {
            probe: self.probe.clone(),
            fail_stop: self.fail_stop,
            exit_at: self.exit.map(|(after, clean)| (Instant::now() + after, clean)),
        }))
    }
}

struct StubHandle {
    probe: WorkloadProbe,
    fail_stop: bool,
    exit_at: Option<(Instant, bool)>,
}

#[async_trait]
impl WorkloadHandle for StubHandle {
    async fn wait(&mut self) -> Result<()> {
        match self.exit_at {
            Some((at, clean)) => {
                tokio::time::sleep_until(at).await;
                if clean {
                    Ok(())
                } else {
                    Err(TestbenchError::Workload("test subject crashed".to_string()))
                }
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(self: Box<Self>) -> Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(TestbenchError::Workload("injected stop failure".to_string()));
        }
        Ok(())
    }
}
