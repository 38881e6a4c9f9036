//! Resolving the container and interface a link is shaped on
//!
//! Router containers are started by the workload collaborator and may take
//! a while to appear. Discovery polls the container runtime until the named
//! container is running and has an interface on the router subnet, or gives
//! up once the configured timeout elapses.

use crate::cancel::Cancellation;
use crate::errors::{Result, TestbenchError};
use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Subnet the router containers attach their shaped interface to
pub const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(172, 25, 0, 0);
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// The `(container, interface)` pair a container actuator shapes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActuationTarget {
    pub container: String,
    pub interface: String,
}

impl ActuationTarget {
    pub fn new(container: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            interface: interface.into(),
        }
    }
}

impl fmt::Display for ActuationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.interface)
    }
}

/// A running container as reported by the runtime
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningWorkload {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Runtime introspection collaborator
#[async_trait]
pub trait RuntimeIntrospection: Send + Sync {
    async fn list_running_workloads(&self) -> Result<Vec<RunningWorkload>>;

    /// Interface of `workload` holding an address inside `prefix`, if any
    async fn interface_for_prefix(
        &self,
        workload: &str,
        prefix: &IpNetwork,
    ) -> Result<Option<String>>;
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Network address of the router subnet
    pub subnet: Ipv4Addr,
    pub prefix_len: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(250),
            subnet: DEFAULT_SUBNET,
            prefix_len: DEFAULT_PREFIX_LEN,
        }
    }
}

impl DiscoveryConfig {
    /// The router subnet as a network prefix
    pub fn prefix(&self) -> Result<IpNetwork> {
        Ipv4Network::new(self.subnet, self.prefix_len)
            .map(IpNetwork::V4)
            .map_err(|e| {
                TestbenchError::InvalidConfig(format!(
                    "router subnet {}/{}: {}",
                    self.subnet, self.prefix_len, e
                ))
            })
    }
}

/// Poll until `target_name` is running with an interface on the configured
/// prefix.
///
/// Returns `Ok(None)` if `cancel` fires first. Runtime errors are fatal;
/// only "not there yet" is retried.
pub async fn resolve(
    runtime: &dyn RuntimeIntrospection,
    target_name: &str,
    config: &DiscoveryConfig,
    cancel: &mut Cancellation,
) -> Result<Option<ActuationTarget>> {
    let prefix = config.prefix()?;
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!("Discovery of {} cancelled", target_name);
            return Ok(None);
        }
        attempts += 1;

        if let Some(target) = try_resolve(runtime, target_name, &prefix).await? {
            info!(
                "Resolved {} after {} attempt(s)",
                target, attempts
            );
            return Ok(Some(target));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TestbenchError::DiscoveryTimeout {
                target: target_name.to_string(),
                timeout: config.timeout,
            });
        }

        let wait = config.poll_interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Discovery of {} cancelled", target_name);
                return Ok(None);
            }
            _ = sleep(wait) => {}
        }
    }
}

async fn try_resolve(
    runtime: &dyn RuntimeIntrospection,
    target_name: &str,
    prefix: &IpNetwork,
) -> Result<Option<ActuationTarget>> {
    let running = runtime.list_running_workloads().await?;
    let Some(workload) = running
        .iter()
        .find(|w| w.name.trim_start_matches('/') == target_name)
    else {
        debug!("{} not running yet", target_name);
        return Ok(None);
    };

    // An address list that is known but outside the prefix means the
    // router network is not connected yet.
    if !workload.addresses.is_empty() && !workload.addresses.iter().any(|a| prefix.contains(*a)) {
        debug!("{} has no address in {} yet", target_name, prefix);
        return Ok(None);
    }

    Ok(runtime
        .interface_for_prefix(target_name, prefix)
        .await?
        .map(|interface| ActuationTarget::new(target_name, interface)))
}

/// Interface name from `ip addr show to <prefix>` output
///
/// The first line looks like `27: eth0@if28: <BROADCAST,...> mtu 1500 ...`.
pub fn parse_interface_name(ip_addr_output: &str) -> Option<String> {
    let field = ip_addr_output.split(':').nth(1)?;
    let name = field.split('@').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// `ps`/`inspect`/`exec` against a docker-compatible CLI
#[derive(Clone, Debug)]
pub struct DockerRuntime {
    executable: String,
}

impl DockerRuntime {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.executable)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                TestbenchError::Discovery(format!("failed to run {}: {}", self.executable, e))
            })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(self.failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn failure(&self, args: &[&str], output: &Output) -> TestbenchError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        TestbenchError::Discovery(format!(
            "{} {} exited with {}: {}",
            self.executable,
            args.join(" "),
            output.status,
            stderr.trim()
        ))
    }
}

/// `inspect` names a container that was removed after `ps` listed it
fn vanished_during_inspect(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such object") || stderr.contains("no such container")
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// One line of `inspect --format '{{.Name}} {{range ...}}{{.IPAddress}} {{end}}'`
fn parse_inspect_line(line: &str) -> Option<RunningWorkload> {
    let mut fields = line.split_whitespace();
    let name = fields.next()?.trim_start_matches('/').to_string();
    let addresses = fields.filter_map(|f| f.parse().ok()).collect();
    Some(RunningWorkload { name, addresses })
}

#[async_trait]
impl RuntimeIntrospection for DockerRuntime {
    async fn list_running_workloads(&self) -> Result<Vec<RunningWorkload>> {
        let ids = self.run(&["ps", "--quiet", "--no-trunc"]).await?;
        let ids: Vec<&str> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec![
            "inspect",
            "--format",
            "{{.Name}} {{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
        ];
        args.extend(ids);
        let output = self.output(&args).await?;
        if !output.status.success() {
            // containers recreated by `up --force-recreate` disappear between
            // `ps` and `inspect`; the ones still running are on stdout
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !vanished_during_inspect(&stderr) {
                return Err(self.failure(&args, &output));
            }
            debug!("Containers vanished before inspect: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_inspect_line)
            .collect())
    }

    async fn interface_for_prefix(
        &self,
        workload: &str,
        prefix: &IpNetwork,
    ) -> Result<Option<String>> {
        let prefix = prefix.to_string();
        let output = self
            .run(&["exec", workload, "ip", "addr", "show", "to", &prefix])
            .await?;
        Ok(parse_interface_name(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel;
    use crate::testing::StubRuntime;

    #[test]
    fn parses_veth_interface_name() {
        let output = "27: eth0@if28: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP group default\n    inet 172.25.0.2/24 brd 172.25.0.255 scope global eth0\n";
        assert_eq!(parse_interface_name(output).as_deref(), Some("eth0"));
        assert_eq!(parse_interface_name("3: eth1: <UP>").as_deref(), Some("eth1"));
        assert_eq!(parse_interface_name(""), None);
    }

    #[test]
    fn parses_inspect_output() {
        let w = parse_inspect_line("/leftrouter 172.25.0.2 10.0.0.3 ").unwrap();
        assert_eq!(w.name, "leftrouter");
        assert_eq!(w.addresses.len(), 2);
        assert!(parse_inspect_line("   ").is_none());
    }

    #[test]
    fn default_prefix_is_router_subnet() {
        let prefix = DiscoveryConfig::default().prefix().unwrap();
        assert_eq!(prefix.to_string(), "172.25.0.0/24");
        assert!(prefix.contains("172.25.0.9".parse().unwrap()));
        assert!(!prefix.contains("172.25.1.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn invalid_prefix_length_is_rejected() {
        let runtime = StubRuntime::new("eth0");
        let config = DiscoveryConfig {
            prefix_len: 33,
            ..Default::default()
        };
        let err = resolve(&runtime, "leftrouter", &config, &mut Cancellation::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TestbenchError::InvalidConfig(_)));
        assert_eq!(runtime.polls(), 0);
    }

    /// Shell script standing in for the docker CLI
    #[cfg(unix)]
    fn fake_docker(dir: &std::path::Path, inspect: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  ps) echo deadbeef; echo cafef00d ;;\n  inspect) {} ;;\n  exec) echo '27: eth0@if28: <BROADCAST,UP> mtu 1500' ;;\nesac\n",
            inspect
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn container_removed_between_ps_and_inspect_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = DockerRuntime::new(fake_docker(
            dir.path(),
            "echo '/leftrouter 172.25.0.2 '; echo 'Error: No such object: deadbeef' >&2; exit 1",
        ));

        let listed = runtime.list_running_workloads().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "leftrouter");

        let target = resolve(&runtime, "leftrouter", &DiscoveryConfig::default(), &mut Cancellation::never())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target, ActuationTarget::new("leftrouter", "eth0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_inspect_failures_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = DockerRuntime::new(fake_docker(
            dir.path(),
            "echo 'permission denied while trying to connect' >&2; exit 1",
        ));

        let err = runtime.list_running_workloads().await.unwrap_err();
        assert!(matches!(err, TestbenchError::Discovery(_)));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_container_appears() {
        let runtime = StubRuntime::new("eth0");
        runtime.appear_after_polls("/leftrouter", 3, vec!["172.25.0.2".parse().unwrap()]);
        let mut cancel = Cancellation::never();

        let target = resolve(&runtime, "leftrouter", &DiscoveryConfig::default(), &mut cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target, ActuationTarget::new("leftrouter", "eth0"));
        assert_eq!(runtime.polls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_container_never_appears() {
        let runtime = StubRuntime::new("eth0");
        let config = DiscoveryConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let started = Instant::now();
        let err = resolve(&runtime, "rightrouter", &config, &mut Cancellation::never())
            .await
            .unwrap_err();

        assert!(matches!(err, TestbenchError::DiscoveryTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn address_outside_prefix_keeps_polling() {
        let runtime = StubRuntime::new("eth0");
        runtime.appear_after_polls("leftrouter", 0, vec!["10.1.0.2".parse().unwrap()]);
        let config = DiscoveryConfig {
            timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let err = resolve(&runtime, "leftrouter", &config, &mut Cancellation::never())
            .await
            .unwrap_err();
        assert!(matches!(err, TestbenchError::DiscoveryTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let runtime = StubRuntime::new("eth0");
        let (handle, mut cancellation) = cancel::channel();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            handle.cancel();
        });

        let resolved = resolve(&runtime, "leftrouter", &DiscoveryConfig::default(), &mut cancellation)
            .await
            .unwrap();
        assert!(resolved.is_none());
        assert!(runtime.polls() <= 6);
    }
}
