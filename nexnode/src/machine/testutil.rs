//! Test doubles shared by the machine, events, trigger, and control tests:
//! a no-op machine backend, a scriptable hypervisor whose "machines" run a
//! simulated agent on the internal bus, and small bus helpers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use nex_agent_api::{
    deploy_subject, trigger_subject, undeploy_subject, DeployRequest, DeployResponse,
    HandshakeRequest, MachineMetadata, WorkloadClaims, WorkloadKind, HANDSHAKE_SUBJECT,
    HEADER_RUNTIME_NS,
};

use crate::bus::{Bus, Message, MessageHandler};
use crate::firecracker::{DriverError, Hypervisor, LaunchOptions, MachineBackend};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub(crate) fn claims(name: &str, kind: WorkloadKind) -> WorkloadClaims {
    WorkloadClaims {
        subject: name.to_string(),
        issuer: "AISSUER".to_string(),
        hash: "abc123".to_string(),
        workload_type: kind,
        description: None,
        recipient_xkey: None,
    }
}

pub(crate) fn deploy_request(trigger_subjects: &[&str]) -> DeployRequest {
    DeployRequest {
        workload_name: "echofn".to_string(),
        workload_type: WorkloadKind::V8,
        description: Some("test workload".to_string()),
        total_bytes: 2048,
        hash: "abc123".to_string(),
        location: "oci://registry/echofn".to_string(),
        environment: HashMap::new(),
        trigger_subjects: trigger_subjects.iter().map(|s| s.to_string()).collect(),
        claims: claims("echofn", WorkloadKind::V8),
    }
}

// ---------------------------------------------------------------------------
// Bus helpers
// ---------------------------------------------------------------------------

/// Forwards every delivered message into an mpsc the test can await.
pub(crate) struct Collect {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }
}

pub(crate) fn collector() -> (Arc<Collect>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Collect { tx }), rx)
}

pub(crate) async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Poll a condition until it holds or the timeout passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// A machine backend with no behavior at all.
pub(crate) struct NullBackend {
    vcpus: u64,
    memory_mib: u64,
}

impl NullBackend {
    pub(crate) fn new(vcpus: u64, memory_mib: u64) -> Self {
        Self { vcpus, memory_mib }
    }
}

#[async_trait]
impl MachineBackend for NullBackend {
    fn ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
    }

    fn vcpus(&self) -> u64 {
        self.vcpus
    }

    fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    async fn set_metadata(&self, _metadata: &MachineMetadata) -> Result<(), DriverError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scriptable hypervisor with a simulated in-guest agent
// ---------------------------------------------------------------------------

/// Launches fake machines whose agents live on the internal bus: they
/// handshake (unless scripted silent), answer deploy/undeploy requests, and
/// echo trigger payloads back with a runtime header.
pub(crate) struct FakeHypervisor {
    internal: Bus,
    /// Launch indexes (0-based) from which agents stay silent forever.
    pub(crate) silent_after: Option<usize>,
    /// Agents sit on deploy requests without ever answering.
    pub(crate) stall_deploys: bool,
    pub(crate) accept_deploys: bool,
    pub(crate) reject_message: String,
    pub(crate) runtime_ns: u64,
    pub(crate) launches: Arc<AtomicUsize>,
    pub(crate) shutdowns: Arc<AtomicUsize>,
    pub(crate) undeploys: Arc<AtomicUsize>,
}

impl FakeHypervisor {
    pub(crate) fn new(internal: Bus) -> Self {
        Self {
            internal,
            silent_after: None,
            stall_deploys: false,
            accept_deploys: true,
            reject_message: "workload artifact hash mismatch".to_string(),
            runtime_ns: 1_500_000,
            launches: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            undeploys: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, opts: &LaunchOptions) -> Result<Box<dyn MachineBackend>, DriverError> {
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let silent = self.silent_after.is_some_and(|after| index >= after);
        Ok(Box::new(FakeBackend {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, ((index % 250) + 2) as u8)),
            vcpus: opts.vcpus,
            memory_mib: opts.memory_mib,
            internal: self.internal.clone(),
            silent,
            stall_deploys: self.stall_deploys,
            accept_deploys: self.accept_deploys,
            reject_message: self.reject_message.clone(),
            runtime_ns: self.runtime_ns,
            shutdowns: self.shutdowns.clone(),
            undeploys: self.undeploys.clone(),
        }))
    }
}

struct FakeBackend {
    ip: IpAddr,
    vcpus: u64,
    memory_mib: u64,
    internal: Bus,
    silent: bool,
    stall_deploys: bool,
    accept_deploys: bool,
    reject_message: String,
    runtime_ns: u64,
    shutdowns: Arc<AtomicUsize>,
    undeploys: Arc<AtomicUsize>,
}

#[async_trait]
impl MachineBackend for FakeBackend {
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
        // Metadata delivery is what boots the simulated agent: it now knows
        // its machine id and where the internal bus is.
        let agent = FakeAgent {
            internal: self.internal.clone(),
            vmid: metadata.vm_id.clone(),
            silent: self.silent,
            stall_deploys: self.stall_deploys,
            accept_deploys: self.accept_deploys,
            reject_message: self.reject_message.clone(),
            runtime_ns: self.runtime_ns,
            undeploys: self.undeploys.clone(),
        };
        tokio::spawn(agent.run());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeAgent {
    internal: Bus,
    vmid: String,
    silent: bool,
    stall_deploys: bool,
    accept_deploys: bool,
    reject_message: String,
    runtime_ns: u64,
    undeploys: Arc<AtomicUsize>,
}

impl FakeAgent {
    async fn run(self) {
        let deploy = self
            .internal
            .subscribe(
                &deploy_subject(&self.vmid),
                Arc::new(DeployResponder {
                    stall: self.stall_deploys,
                    accept: self.accept_deploys,
                    message: self.reject_message.clone(),
                }),
            )
            .await
            .unwrap();
        let undeploy = self
            .internal
            .subscribe(
                &undeploy_subject(&self.vmid),
                Arc::new(UndeployResponder {
                    undeploys: self.undeploys.clone(),
                }),
            )
            .await
            .unwrap();
        let trigger = self
            .internal
            .subscribe(
                &trigger_subject(&self.vmid),
                Arc::new(AgentTriggerResponder {
                    runtime_ns: self.runtime_ns,
                }),
            )
            .await
            .unwrap();

        if !self.silent {
            let hello = HandshakeRequest {
                machine_id: self.vmid.clone(),
                message: Some("agent booted".to_string()),
            };
            let _ = self
                .internal
                .request(
                    HANDSHAKE_SUBJECT,
                    serde_json::to_vec(&hello).unwrap(),
                    Duration::from_secs(1),
                )
                .await;
        }

        // Keep the agent's subscriptions alive until the test runtime drops.
        let _keep = (deploy, undeploy, trigger);
        std::future::pending::<()>().await;
    }
}

struct DeployResponder {
    stall: bool,
    accept: bool,
    message: String,
}

#[async_trait]
impl MessageHandler for DeployResponder {
    async fn handle(&self, msg: Message) {
        if self.stall {
            // Outlive any reasonable deploy deadline, then drop the request.
            tokio::time::sleep(Duration::from_secs(5)).await;
            return;
        }
        let response = if self.accept {
            DeployResponse {
                accepted: true,
                message: None,
            }
        } else {
            DeployResponse {
                accepted: false,
                message: Some(self.message.clone()),
            }
        };
        msg.respond(serde_json::to_vec(&response).unwrap());
    }
}

struct UndeployResponder {
    undeploys: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for UndeployResponder {
    async fn handle(&self, msg: Message) {
        self.undeploys.fetch_add(1, Ordering::SeqCst);
        msg.respond(Vec::new());
    }
}

struct AgentTriggerResponder {
    runtime_ns: u64,
}

#[async_trait]
impl MessageHandler for AgentTriggerResponder {
    async fn handle(&self, msg: Message) {
        let mut reply = Message::new("_reply", msg.payload.clone());
        reply
            .headers
            .insert(HEADER_RUNTIME_NS, self.runtime_ns.to_string());
        msg.respond_msg(reply);
    }
}
