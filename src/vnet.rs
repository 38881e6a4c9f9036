//! In-process virtual routers
//!
//! Each router owns a token-bucket rate limiter that the virtual-router
//! actuator reconfigures phase by phase. [`LoopbackTraffic`] pushes a
//! constant offered load through both limiters so a run has something to
//! shape without external test subjects.

use crate::cancel::{self, CancelHandle, Cancellation};
use crate::errors::{Result, TestbenchError};
use crate::workload::{Workload, WorkloadEnv, WorkloadHandle};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Burst cap of every router's token bucket, in bytes
pub const DEFAULT_MAX_BURST_BYTES: u32 = 100_000;

pub const LEFT_ROUTER: &str = "leftrouter";
pub const RIGHT_ROUTER: &str = "rightrouter";

struct Bucket {
    rate_bps: u64,
    max_burst_bytes: u32,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let dt = (now - self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + dt * (self.rate_bps as f64 / 8.0))
            .min(self.max_burst_bytes as f64);
    }
}

/// Token bucket limiting one router's forwarding rate
pub struct RateLimiter {
    name: String,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, rate_bps: u64, max_burst_bytes: u32) -> Self {
        Self {
            name: name.into(),
            bucket: Mutex::new(Bucket {
                rate_bps,
                max_burst_bytes,
                tokens: max_burst_bytes as f64,
                last: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change rate and burst; tokens already earned are kept up to the new cap
    pub fn set(&self, rate_bps: u64, max_burst_bytes: u32) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.rate_bps = rate_bps;
        bucket.max_burst_bytes = max_burst_bytes;
        bucket.tokens = bucket.tokens.min(max_burst_bytes as f64);
        debug!(
            "{}: rate limit set to {} bit/s, burst {} bytes",
            self.name, rate_bps, max_burst_bytes
        );
    }

    /// Take `bytes` from the bucket if enough tokens are available
    pub fn allow(&self, bytes: usize) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        if bucket.tokens >= bytes as f64 {
            bucket.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }

    pub fn rate_bps(&self) -> u64 {
        self.bucket.lock().rate_bps
    }

    pub fn max_burst_bytes(&self) -> u32 {
        self.bucket.lock().max_burst_bytes
    }
}

/// A named router starting at the reference capacity
pub struct VirtualRouter {
    limiter: Arc<RateLimiter>,
}

impl VirtualRouter {
    pub fn new(name: impl Into<String>, reference_capacity_bps: u64) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(
                name,
                reference_capacity_bps,
                DEFAULT_MAX_BURST_BYTES,
            )),
        }
    }

    pub fn name(&self) -> &str {
        self.limiter.name()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    /// Handle for actuators; it goes stale once the router is dropped
    pub fn handle(&self) -> Weak<RateLimiter> {
        Arc::downgrade(&self.limiter)
    }
}

/// The left and right routers of one test run
pub struct VirtualNetwork {
    pub left: VirtualRouter,
    pub right: VirtualRouter,
}

impl VirtualNetwork {
    pub fn new(reference_capacity_bps: u64) -> Self {
        Self {
            left: VirtualRouter::new(LEFT_ROUTER, reference_capacity_bps),
            right: VirtualRouter::new(RIGHT_ROUTER, reference_capacity_bps),
        }
    }

    pub fn limiters(&self) -> Vec<Arc<RateLimiter>> {
        vec![self.left.limiter(), self.right.limiter()]
    }
}

/// Constant-rate synthetic load through a set of limiters
#[derive(Clone)]
pub struct LoopbackTraffic {
    limiters: Vec<Arc<RateLimiter>>,
    offered_bps: u64,
    packet_bytes: usize,
    report_interval: Duration,
}

impl LoopbackTraffic {
    pub fn new(limiters: Vec<Arc<RateLimiter>>, offered_bps: u64) -> Self {
        Self {
            limiters,
            offered_bps,
            packet_bytes: 1200,
            report_interval: Duration::from_secs(1),
        }
    }

    fn packet_interval(&self) -> Duration {
        let bits = (self.packet_bytes * 8) as f64;
        Duration::from_secs_f64(bits / self.offered_bps.max(1) as f64)
    }
}

#[async_trait]
impl Workload for LoopbackTraffic {
    async fn start(&self, _env: &WorkloadEnv) -> Result<Box<dyn WorkloadHandle>> {
        if self.offered_bps == 0 {
            return Err(TestbenchError::Workload(
                "offered load must be non-zero".to_string(),
            ));
        }
        let (cancel, cancellation) = cancel::channel();
        let mut tasks = JoinSet::new();
        for limiter in &self.limiters {
            tasks.spawn(offer_load(
                limiter.clone(),
                self.packet_bytes,
                self.packet_interval(),
                self.report_interval,
                cancellation.clone(),
            ));
        }
        info!(
            "Loopback traffic offering {} bit/s through {} router(s)",
            self.offered_bps,
            self.limiters.len()
        );
        Ok(Box::new(LoopbackHandle { cancel, tasks }))
    }
}

async fn offer_load(
    limiter: Arc<RateLimiter>,
    packet_bytes: usize,
    packet_interval: Duration,
    report_interval: Duration,
    mut cancel: Cancellation,
) -> u64 {
    let mut send = interval(packet_interval);
    send.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut report = interval(report_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report.tick().await;

    let mut delivered_total = 0u64;
    let mut delivered_window = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = send.tick() => {
                if limiter.allow(packet_bytes) {
                    delivered_window += packet_bytes as u64;
                }
            }
            _ = report.tick() => {
                let bps = delivered_window * 8 * 1000 / report_interval.as_millis().max(1) as u64;
                debug!(
                    "{}: delivered {} bit/s (limit {} bit/s)",
                    limiter.name(),
                    bps,
                    limiter.rate_bps()
                );
                delivered_total += delivered_window;
                delivered_window = 0;
            }
        }
    }
    delivered_total + delivered_window
}

struct LoopbackHandle {
    cancel: CancelHandle,
    tasks: JoinSet<u64>,
}

#[async_trait]
impl WorkloadHandle for LoopbackHandle {
    async fn wait(&mut self) -> Result<()> {
        // synthetic load never exits on its own
        std::future::pending().await
    }

    async fn stop(mut self: Box<Self>) -> Result<()> {
        self.cancel.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            let delivered = joined.map_err(|e| TestbenchError::Task(e.to_string()))?;
            debug!("Loopback flow delivered {} bytes", delivered);
        }
        Ok(())
    }
}
