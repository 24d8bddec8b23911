//! Hypervisor seam and the Firecracker process driver.
//!
//! The machine manager only speaks to [`Hypervisor`] and [`MachineBackend`];
//! the concrete driver spawns one `firecracker` process per machine with a
//! generated config file and talks to its API socket for metadata delivery
//! and graceful shutdown.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use nex_agent_api::MachineMetadata;

use crate::config::MachineTemplate;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(std::io::Error),
    #[error("hypervisor API socket {0} did not appear in time")]
    SocketTimeout(PathBuf),
    #[error("hypervisor API call failed: {0}")]
    Api(String),
    #[error("encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the manager needs to launch one machine.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub vmid: String,
    pub vcpus: u64,
    pub memory_mib: u64,
}

/// Launches machines. The manager never sees processes or sockets.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn launch(&self, opts: &LaunchOptions) -> Result<Box<dyn MachineBackend>, DriverError>;
}

/// A running machine as the manager sees it. Resource figures are fixed at
/// launch; teardown bookkeeping depends on them never changing.
#[async_trait]
pub trait MachineBackend: Send + Sync {
    fn ip(&self) -> IpAddr;
    fn vcpus(&self) -> u64;
    fn memory_mib(&self) -> u64;
    /// Hand the guest its boot metadata (internal bus address and vm id).
    async fn set_metadata(&self, metadata: &MachineMetadata) -> Result<(), DriverError>;
    /// Tear the machine down and release its host-side resources.
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// Name of the control socket a machine owned by this process uses. The pid
/// component lets a node clean up exactly its own stale sockets on stop.
pub fn socket_name(vmid: &str) -> String {
    format!(".firecracker.sock-{}-{}", std::process::id(), vmid)
}

/// Filename prefix matching every control socket owned by this process.
pub fn socket_prefix() -> String {
    format!(".firecracker.sock-{}-", std::process::id())
}

// ---------------------------------------------------------------------------
// Firecracker process driver
// ---------------------------------------------------------------------------

pub struct FirecrackerDriver {
    template: MachineTemplate,
    /// Offset from `guest_ip_base` for the next machine.
    next_ip_offset: AtomicU32,
}

impl FirecrackerDriver {
    pub fn new(template: MachineTemplate) -> Self {
        Self {
            template,
            next_ip_offset: AtomicU32::new(0),
        }
    }

    fn allocate_ip(&self) -> Ipv4Addr {
        let offset = self.next_ip_offset.fetch_add(1, Ordering::Relaxed);
        Ipv4Addr::from(u32::from(self.template.guest_ip_base).wrapping_add(offset))
    }
}

#[async_trait]
impl Hypervisor for FirecrackerDriver {
    async fn launch(&self, opts: &LaunchOptions) -> Result<Box<dyn MachineBackend>, DriverError> {
        let ip = self.allocate_ip();
        let socket_path = std::env::temp_dir().join(socket_name(&opts.vmid));
        let config_path = std::env::temp_dir().join(format!(".firecracker.cfg-{}.json", opts.vmid));

        let config = vm_config(&self.template, opts, ip);
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&config)?).await?;

        let child = Command::new(&self.template.firecracker_binary)
            .arg("--id")
            .arg(&opts.vmid)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(DriverError::Spawn)?;

        if let Err(e) = wait_for_socket(&socket_path, self.template.socket_wait()).await {
            warn!(vmid = %opts.vmid, "API socket did not appear, killing hypervisor");
            let mut child = child;
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(&config_path).await;
            return Err(e);
        }

        debug!(vmid = %opts.vmid, %ip, "hypervisor process up");
        Ok(Box::new(FirecrackerMachine {
            vmid: opts.vmid.clone(),
            ip: IpAddr::V4(ip),
            vcpus: opts.vcpus,
            memory_mib: opts.memory_mib,
            socket_path,
            config_path,
            child: Mutex::new(child),
        }))
    }
}

/// Firecracker `--config-file` document.
fn vm_config(template: &MachineTemplate, opts: &LaunchOptions, ip: Ipv4Addr) -> serde_json::Value {
    // The tap device carries a short id; full ids overflow IFNAMSIZ.
    let short_id: String = opts.vmid.chars().take(8).collect();
    json!({
        "boot-source": {
            "kernel_image_path": template.kernel_path,
            "boot_args": format!(
                "console=ttyS0 reboot=k panic=1 pci=off ip={ip}::{gw}:255.255.255.0::eth0:off",
                gw = template.gateway_ip,
            ),
        },
        "drives": [{
            "drive_id": "rootfs",
            "path_on_host": template.rootfs_path,
            "is_root_device": true,
            "is_read_only": false,
        }],
        "machine-config": {
            "vcpu_count": opts.vcpus,
            "mem_size_mib": opts.memory_mib,
        },
        "network-interfaces": [{
            "iface_id": "eth0",
            "host_dev_name": format!("tap-{short_id}"),
        }],
        "mmds-config": {
            "version": "V2",
            "network_interfaces": ["eth0"],
        },
    })
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), DriverError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);
    loop {
        if path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::SocketTimeout(path.to_path_buf()));
        }
        trace!(path = %path.display(), "waiting for hypervisor API socket");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_millis(250));
    }
}

struct FirecrackerMachine {
    vmid: String,
    ip: IpAddr,
    vcpus: u64,
    memory_mib: u64,
    socket_path: PathBuf,
    config_path: PathBuf,
    child: Mutex<Child>,
}

#[async_trait]
impl MachineBackend for FirecrackerMachine {
    fn ip(&self) -> IpAddr {
        self.ip
    }

    fn vcpus(&self) -> u64 {
        self.vcpus
    }

    fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    async fn set_metadata(&self, metadata: &MachineMetadata) -> Result<(), DriverError> {
        let body = serde_json::to_value(metadata)?;
        api_put(&self.socket_path, "/mmds", &body).await
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        // Graceful first: Ctrl+Alt+Del lets the guest run its shutdown hooks.
        let action = json!({ "action_type": "SendCtrlAltDel" });
        if let Err(e) = api_put(&self.socket_path, "/actions", &action).await {
            debug!(vmid = %self.vmid, error = %e, "graceful shutdown action failed");
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
            Ok(Ok(status)) => {
                debug!(vmid = %self.vmid, exit = ?status.code(), "hypervisor exited gracefully")
            }
            _ => {
                warn!(vmid = %self.vmid, "hypervisor did not exit, killing");
                let _ = child.kill().await;
            }
        }

        let _ = tokio::fs::remove_file(&self.socket_path).await;
        let _ = tokio::fs::remove_file(&self.config_path).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP/1.1 client for the hypervisor's Unix-socket API
// ---------------------------------------------------------------------------

async fn api_put(socket: &Path, path: &str, body: &serde_json::Value) -> Result<(), DriverError> {
    let mut stream = UnixStream::connect(socket).await?;
    let body = serde_json::to_vec(body)?;
    let mut request = format!(
        "PUT {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status = parse_status(&status_line)
        .ok_or_else(|| DriverError::Api(format!("malformed status line: {status_line:?}")))?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(DriverError::Api(format!(
            "{path} returned HTTP {status}"
        )))
    }
}

fn parse_status(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}
