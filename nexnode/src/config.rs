use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use nex_agent_api::WorkloadKind;

/// Top-level configuration for the node daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of pre-booted machines kept warm for instant assignment.
    pub machine_pool_size: usize,
    /// Skip the CNI state reset on startup.
    pub preserve_network: bool,
    /// Workload kinds this node accepts.
    pub workload_types: Vec<WorkloadKind>,
    /// Issuer allow-list for workload claims. Empty admits every issuer.
    pub valid_issuers: Vec<String>,
    /// Free-form tags advertised in ping/info responses.
    pub tags: HashMap<String, String>,
    /// Host address of the internal bus, handed to every guest at boot.
    pub internal_node_host: String,
    /// Port of the internal bus, handed to every guest at boot.
    pub internal_node_port: u16,
    /// When true, the very first handshake timeout cancels the whole node.
    /// A failing first boot almost always means a node-level misconfiguration
    /// that would sink every subsequent machine too.
    pub strict_first_handshake: bool,
    /// CNI state directory cleared on startup unless `preserve_network`.
    pub cni_state_dir: PathBuf,
    pub timeouts: TimeoutConfig,
    pub machine: MachineTemplate,
    pub telemetry: TelemetryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine_pool_size: 1,
            preserve_network: false,
            workload_types: vec![WorkloadKind::Elf],
            valid_issuers: Vec::new(),
            tags: HashMap::new(),
            internal_node_host: "192.168.127.1".to_string(),
            internal_node_port: 9222,
            strict_first_handshake: true,
            cni_state_dir: PathBuf::from("/var/lib/cni"),
            timeouts: TimeoutConfig::default(),
            machine: MachineTemplate::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: NodeConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values. The node refuses to start otherwise.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.machine_pool_size >= 1, "machine_pool_size must be >= 1");
        anyhow::ensure!(
            !self.workload_types.is_empty(),
            "workload_types must not be empty"
        );
        anyhow::ensure!(
            !self.internal_node_host.is_empty(),
            "internal_node_host must not be empty"
        );
        anyhow::ensure!(
            self.timeouts.handshake_ms > 0
                && self.timeouts.deploy_ms > 0
                && self.timeouts.undeploy_ms > 0
                && self.timeouts.trigger_ms > 0,
            "all timeouts must be > 0"
        );
        anyhow::ensure!(self.machine.vcpus >= 1, "machine.vcpus must be >= 1");
        anyhow::ensure!(
            self.machine.memory_mib >= 128,
            "machine.memory_mib must be >= 128"
        );
        Ok(())
    }
}

/// Request deadlines for the internal bus. The defaults mirror what the
/// agent can realistically answer within; undeploy in particular is short so
/// a wedged workload cannot stall machine teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a fresh machine gets to complete its first handshake.
    pub handshake_ms: u64,
    /// Deadline for the agent to acknowledge a deployment.
    pub deploy_ms: u64,
    /// Deadline for graceful workload undeploy during stop.
    pub undeploy_ms: u64,
    /// Deadline for a single trigger invocation round trip.
    pub trigger_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 5_000,
            deploy_ms: 1_000,
            undeploy_ms: 500,
            trigger_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_millis(self.deploy_ms)
    }

    pub fn undeploy(&self) -> Duration {
        Duration::from_millis(self.undeploy_ms)
    }

    pub fn trigger(&self) -> Duration {
        Duration::from_millis(self.trigger_ms)
    }
}

/// How each warm machine is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineTemplate {
    /// Path to the uncompressed kernel image.
    pub kernel_path: PathBuf,
    /// Path to the root filesystem image cloned for each machine.
    pub rootfs_path: PathBuf,
    /// Path to the firecracker binary.
    pub firecracker_binary: PathBuf,
    pub vcpus: u64,
    pub memory_mib: u64,
    /// Host-side gateway address guests route through.
    pub gateway_ip: Ipv4Addr,
    /// First guest address handed out; subsequent machines count up from it.
    pub guest_ip_base: Ipv4Addr,
    /// How long to wait for the hypervisor API socket after spawn.
    pub socket_wait_ms: u64,
}

impl Default for MachineTemplate {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/nex/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/nex/rootfs.ext4"),
            firecracker_binary: PathBuf::from("firecracker"),
            vcpus: 1,
            memory_mib: 256,
            gateway_ip: Ipv4Addr::new(192, 168, 127, 1),
            guest_ip_base: Ipv4Addr::new(192, 168, 127, 2),
            socket_wait_ms: 2_000,
        }
    }
}

impl MachineTemplate {
    pub fn socket_wait(&self) -> Duration {
        Duration::from_millis(self.socket_wait_ms)
    }
}

/// Telemetry exporter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Address to serve `/metrics` and `/healthz` on. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,
}
