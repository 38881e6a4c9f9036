//! Network actuators
//!
//! An actuator applies one phase's impairment to a concrete network
//! element. The backend is chosen once when a test run is assembled; link
//! runners only ever see `Box<dyn Actuator>`.

use crate::cancel::Cancellation;
use crate::discovery::{self, ActuationTarget, DiscoveryConfig, RuntimeIntrospection};
use crate::errors::{Result, TestbenchError};
use crate::qdisc::ShapingCommands;
use crate::vnet::{RateLimiter, DEFAULT_MAX_BURST_BYTES};
use async_trait::async_trait;
use scenarios::Impairment;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Result of resolving an actuator's target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    Cancelled,
}

#[async_trait]
pub trait Actuator: Send {
    /// Resolve the actuation target. Only the first successful call does
    /// any work.
    async fn attach(&mut self, cancel: &mut Cancellation) -> Result<Attachment>;

    /// Install (`is_first`) or replace the impairment on the target
    async fn apply(&mut self, config: &Impairment, is_first: bool) -> Result<()>;

    /// Rate written to the link log once `config` is applied
    fn applied_rate(&self, config: &Impairment) -> u64;

    fn target_name(&self) -> &str;
}

/// Shapes a router container's interface with netem + tbf
pub struct ContainerActuator {
    container: String,
    runtime: Arc<dyn RuntimeIntrospection>,
    shaper: Arc<dyn ShapingCommands>,
    discovery: DiscoveryConfig,
    target: Option<ActuationTarget>,
}

impl ContainerActuator {
    pub fn new(
        container: impl Into<String>,
        runtime: Arc<dyn RuntimeIntrospection>,
        shaper: Arc<dyn ShapingCommands>,
        discovery: DiscoveryConfig,
    ) -> Self {
        Self {
            container: container.into(),
            runtime,
            shaper,
            discovery,
            target: None,
        }
    }

    pub fn target(&self) -> Option<&ActuationTarget> {
        self.target.as_ref()
    }
}

#[async_trait]
impl Actuator for ContainerActuator {
    async fn attach(&mut self, cancel: &mut Cancellation) -> Result<Attachment> {
        if self.target.is_some() {
            return Ok(Attachment::Attached);
        }
        match discovery::resolve(self.runtime.as_ref(), &self.container, &self.discovery, cancel)
            .await?
        {
            Some(target) => {
                info!("Shaping {} on interface {}", target.container, target.interface);
                self.target = Some(target);
                Ok(Attachment::Attached)
            }
            None => Ok(Attachment::Cancelled),
        }
    }

    async fn apply(&mut self, config: &Impairment, is_first: bool) -> Result<()> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| TestbenchError::NotAttached(self.container.clone()))?;
        let spec = match config {
            Impairment::Absolute(spec) => spec,
            Impairment::Relative(_) => {
                return Err(TestbenchError::Actuation(format!(
                    "{}: capacity ratios need the virtual-router backend",
                    self.container
                )))
            }
        };

        // No rollback: a failed tbf leaves the netem change in place.
        self.shaper
            .install_or_update_delay(
                target,
                Duration::from_millis(spec.delay_ms as u64),
                Duration::from_millis(spec.jitter_ms as u64),
                is_first,
            )
            .await?;
        self.shaper
            .install_or_update_rate(
                target,
                spec.rate_bps,
                spec.burst_bytes,
                Duration::from_millis(spec.latency_ms as u64),
                is_first,
            )
            .await?;
        debug!("{}: applied {}", target, config);
        Ok(())
    }

    fn applied_rate(&self, config: &Impairment) -> u64 {
        config.rate_bps(0)
    }

    fn target_name(&self) -> &str {
        &self.container
    }
}

/// Sets the rate of an in-process router's token bucket
pub struct VirtualRouterActuator {
    name: String,
    limiter: Weak<RateLimiter>,
    reference_capacity_bps: u64,
    max_burst_bytes: u32,
}

impl VirtualRouterActuator {
    pub fn new(limiter: &Arc<RateLimiter>, reference_capacity_bps: u64) -> Self {
        Self {
            name: limiter.name().to_string(),
            limiter: Arc::downgrade(limiter),
            reference_capacity_bps,
            max_burst_bytes: DEFAULT_MAX_BURST_BYTES,
        }
    }

    pub fn with_max_burst(mut self, max_burst_bytes: u32) -> Self {
        self.max_burst_bytes = max_burst_bytes;
        self
    }

    fn limiter(&self) -> Result<Arc<RateLimiter>> {
        self.limiter.upgrade().ok_or_else(|| {
            TestbenchError::Actuation(format!("rate limiter {} no longer exists", self.name))
        })
    }
}

#[async_trait]
impl Actuator for VirtualRouterActuator {
    async fn attach(&mut self, _cancel: &mut Cancellation) -> Result<Attachment> {
        self.limiter()?;
        Ok(Attachment::Attached)
    }

    async fn apply(&mut self, config: &Impairment, _is_first: bool) -> Result<()> {
        let limiter = self.limiter()?;
        let burst = match config {
            Impairment::Absolute(spec) => spec.burst_bytes,
            Impairment::Relative(_) => self.max_burst_bytes,
        };
        limiter.set(self.applied_rate(config), burst);
        Ok(())
    }

    fn applied_rate(&self, config: &Impairment) -> u64 {
        config.rate_bps(self.reference_capacity_bps)
    }

    fn target_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ShapingCall, StubRuntime, StubShaper};
    use crate::vnet::VirtualRouter;
    use scenarios::ShapingSpec;

    fn container_actuator(shaper: Arc<StubShaper>) -> ContainerActuator {
        let runtime = StubRuntime::new("eth0");
        runtime.appear_after_polls("leftrouter", 0, vec![]);
        ContainerActuator::new(
            "leftrouter",
            Arc::new(runtime),
            shaper,
            DiscoveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn container_applies_netem_then_tbf() {
        let shaper = Arc::new(StubShaper::default());
        let mut actuator = container_actuator(shaper.clone());
        assert_eq!(
            actuator.attach(&mut Cancellation::never()).await.unwrap(),
            Attachment::Attached
        );

        let config = Impairment::absolute(ShapingSpec::reference(2_500_000));
        actuator.apply(&config, true).await.unwrap();
        actuator.apply(&config, false).await.unwrap();

        let calls = shaper.calls();
        assert_eq!(calls.len(), 4);
        assert!(matches!(calls[0], ShapingCall::Delay { is_first: true, .. }));
        assert!(matches!(
            calls[1],
            ShapingCall::Rate { rate_bps: 2_500_000, is_first: true, .. }
        ));
        assert!(matches!(calls[2], ShapingCall::Delay { is_first: false, .. }));
        assert_eq!(actuator.applied_rate(&config), 2_500_000);
    }

    #[tokio::test]
    async fn container_reports_partial_failure_without_rollback() {
        let shaper = Arc::new(StubShaper::default());
        shaper.fail_rate_updates();
        let mut actuator = container_actuator(shaper.clone());
        actuator.attach(&mut Cancellation::never()).await.unwrap();

        let config = Impairment::absolute(ShapingSpec::reference(1_000_000));
        let err = actuator.apply(&config, true).await.unwrap_err();
        assert!(matches!(err, TestbenchError::Actuation(_)));
        // the delay discipline stays installed
        assert_eq!(shaper.calls().len(), 1);
    }

    #[tokio::test]
    async fn container_apply_before_attach_fails() {
        let shaper = Arc::new(StubShaper::default());
        let mut actuator = container_actuator(shaper.clone());
        let err = actuator
            .apply(&Impairment::absolute(ShapingSpec::reference(1)), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TestbenchError::NotAttached(_)));
        assert!(shaper.calls().is_empty());
    }

    #[tokio::test]
    async fn container_rejects_capacity_ratio() {
        let shaper = Arc::new(StubShaper::default());
        let mut actuator = container_actuator(shaper.clone());
        actuator.attach(&mut Cancellation::never()).await.unwrap();
        assert!(actuator.apply(&Impairment::ratio(1.0), true).await.is_err());
        assert!(shaper.calls().is_empty());
    }

    #[tokio::test]
    async fn target_is_resolved_once() {
        let runtime = Arc::new(StubRuntime::new("eth0"));
        runtime.appear_after_polls("leftrouter", 0, vec![]);
        let mut actuator = ContainerActuator::new(
            "leftrouter",
            runtime.clone(),
            Arc::new(StubShaper::default()),
            DiscoveryConfig::default(),
        );
        let mut cancel = Cancellation::never();
        actuator.attach(&mut cancel).await.unwrap();
        actuator.attach(&mut cancel).await.unwrap();
        assert_eq!(runtime.polls(), 1);
        assert_eq!(
            actuator.target(),
            Some(&ActuationTarget::new("leftrouter", "eth0"))
        );
    }

    #[tokio::test]
    async fn virtual_router_scales_reference_capacity() {
        let router = VirtualRouter::new("leftrouter", 1_000_000);
        let limiter = router.limiter();
        let mut actuator = VirtualRouterActuator::new(&limiter, 1_000_000);
        actuator.attach(&mut Cancellation::never()).await.unwrap();

        actuator.apply(&Impairment::ratio(2.5), true).await.unwrap();
        assert_eq!(limiter.rate_bps(), 2_500_000);
        assert_eq!(limiter.max_burst_bytes(), DEFAULT_MAX_BURST_BYTES);

        actuator.apply(&Impairment::ratio(0.6), false).await.unwrap();
        assert_eq!(limiter.rate_bps(), 600_000);
    }

    #[tokio::test]
    async fn virtual_router_fails_once_limiter_is_gone() {
        let router = VirtualRouter::new("rightrouter", 1_000_000);
        let mut actuator = VirtualRouterActuator::new(&router.limiter(), 1_000_000);
        drop(router);
        let err = actuator.apply(&Impairment::ratio(1.0), true).await.unwrap_err();
        assert!(err.to_string().contains("rightrouter"));
        assert!(actuator.attach(&mut Cancellation::never()).await.is_err());
    }
}
