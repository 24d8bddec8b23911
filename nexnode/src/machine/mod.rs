//! The machine manager: warm pool maintenance, agent handshakes, workload
//! deployment, trigger routing, and machine teardown.

pub mod pool;
pub mod registry;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

pub use registry::{Deployment, Machine, MachineRegistry, MachineState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nex_agent_api::{
    deploy_subject, undeploy_subject, DeployRequest, DeployResponse, HandshakeRequest,
    HandshakeResponse, MachineMetadata, AGENT_EVENT_PATTERN, AGENT_LOG_PATTERN, HANDSHAKE_SUBJECT,
};

use crate::bus::{Bus, BusError, Message, MessageHandler, Subscription};
use crate::config::NodeConfig;
use crate::events::{AgentEventRelay, AgentLogRelay, EventPublisher, NodeEvent, SYSTEM_NAMESPACE};
use crate::firecracker::{socket_prefix, DriverError, Hypervisor, LaunchOptions};
use crate::network;
use crate::telemetry::Telemetry;

use self::pool::WarmPool;
use self::trigger::TriggerRouter;

/// Poll interval for the pool maintainer and handshake watchdogs.
const RUNLOOP_SLEEP: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid node configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("no handshake from agent in machine {0} within {1:?}")]
    HandshakeTimeout(String, Duration),
    #[error("timed out waiting for acknowledgement of workload deployment on machine {0}")]
    DeployTimeout(String),
    #[error("workload rejected by agent: {0}")]
    AgentRejected(String),
    #[error("failed to subscribe to trigger subject {subject}: {source}")]
    SubscribeFailed {
        subject: String,
        #[source]
        source: BusError,
    },
    #[error("no machine with id {0}")]
    NotFound(String),
    #[error("trigger request on subject {0} timed out")]
    TriggerTimeout(String),
    #[error("encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coordinates the pool of warm microVMs: boots new ones, binds validated
/// workloads to them, routes triggers, and tears machines down on stop.
pub struct MachineManager {
    config: NodeConfig,
    external: Bus,
    internal: Bus,
    hypervisor: Arc<dyn Hypervisor>,
    telemetry: Telemetry,
    events: EventPublisher,
    registry: Arc<MachineRegistry>,
    pool: WarmPool,
    cancel: CancellationToken,
    closing: AtomicBool,
    /// Handshake and relay subscriptions, drained on manager stop.
    core_subs: Mutex<Vec<Subscription>>,
}

impl MachineManager {
    /// Build a manager and install its internal-bus subscriptions
    /// (handshake receiver, agent event and log relays).
    pub async fn new(
        config: NodeConfig,
        external: Bus,
        internal: Bus,
        hypervisor: Arc<dyn Hypervisor>,
        telemetry: Telemetry,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, NodeError> {
        config
            .validate()
            .map_err(|e| NodeError::ConfigInvalid(e.to_string()))?;

        let registry = Arc::new(MachineRegistry::new());
        let pool = WarmPool::new(config.machine_pool_size);
        let events = EventPublisher::new(external.clone());

        let mut core_subs = Vec::new();
        core_subs.push(
            internal
                .subscribe(
                    HANDSHAKE_SUBJECT,
                    Arc::new(HandshakeIngress {
                        registry: registry.clone(),
                    }),
                )
                .await
                .map_err(|e| NodeError::SubscribeFailed {
                    subject: HANDSHAKE_SUBJECT.to_string(),
                    source: e,
                })?,
        );
        core_subs.push(
            internal
                .subscribe(
                    AGENT_EVENT_PATTERN,
                    Arc::new(AgentEventRelay {
                        registry: registry.clone(),
                        external: external.clone(),
                    }),
                )
                .await
                .map_err(|e| NodeError::SubscribeFailed {
                    subject: AGENT_EVENT_PATTERN.to_string(),
                    source: e,
                })?,
        );
        core_subs.push(
            internal
                .subscribe(
                    AGENT_LOG_PATTERN,
                    Arc::new(AgentLogRelay {
                        registry: registry.clone(),
                        external: external.clone(),
                    }),
                )
                .await
                .map_err(|e| NodeError::SubscribeFailed {
                    subject: AGENT_LOG_PATTERN.to_string(),
                    source: e,
                })?,
        );

        Ok(Arc::new(Self {
            config,
            external,
            internal,
            hypervisor,
            telemetry,
            events,
            registry,
            pool,
            cancel,
            closing: AtomicBool::new(false),
            core_subs: Mutex::new(core_subs),
        }))
    }

    pub fn registry(&self) -> Arc<MachineRegistry> {
        self.registry.clone()
    }

    pub fn lookup(&self, machine_id: &str) -> Option<Arc<Machine>> {
        self.registry.lookup(machine_id)
    }

    fn stopping(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Spawn the pool maintainer.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move { manager.run_pool_loop().await });
    }

    async fn run_pool_loop(self: Arc<Self>) {
        info!("machine manager starting");

        if !self.config.preserve_network {
            if let Err(e) = network::reset_cni(&self.config.cni_state_dir).await {
                warn!(error = %e, "failed to reset network state");
            }
        }

        while !self.stopping() && !self.cancel.is_cancelled() {
            if self.pool.is_full() {
                tokio::time::sleep(RUNLOOP_SLEEP).await;
                continue;
            }

            if let Err(e) = self.spawn_warm_machine().await {
                warn!(error = %e, "failed to add machine to warm pool");
                tokio::time::sleep(RUNLOOP_SLEEP).await;
            }
        }

        debug!("pool maintainer exiting");
    }

    /// Boot one machine, register it, start its handshake watchdog, and
    /// enqueue it. A failure anywhere leaves nothing behind in the registry.
    async fn spawn_warm_machine(self: &Arc<Self>) -> Result<(), NodeError> {
        let vmid = uuid::Uuid::new_v4().simple().to_string();
        let opts = LaunchOptions {
            vmid: vmid.clone(),
            vcpus: self.config.machine.vcpus,
            memory_mib: self.config.machine.memory_mib,
        };

        let backend = self.hypervisor.launch(&opts).await?;
        let machine = Arc::new(Machine::new(vmid.clone(), backend));
        // Register before metadata delivery so a quick agent's handshake
        // always finds the machine.
        self.registry.insert(machine.clone());

        let metadata = MachineMetadata {
            vm_id: vmid.clone(),
            node_host: self.config.internal_node_host.clone(),
            node_port: self.config.internal_node_port,
            message: Some("host-supplied metadata".to_string()),
        };
        if let Err(e) = machine.backend().set_metadata(&metadata).await {
            self.registry.remove(&vmid);
            if let Err(stop_err) = machine.backend().shutdown().await {
                warn!(vmid = %vmid, error = %stop_err, "failed to tear down machine after metadata failure");
            }
            return Err(e.into());
        }

        let watchdog = self.clone();
        let watchdog_id = vmid.clone();
        tokio::spawn(async move { watchdog.await_handshake(watchdog_id).await });

        info!(vmid = %vmid, ip = %machine.ip, "adding machine to warm pool");
        if self.pool.push(machine).await.is_err() {
            // Shutdown closed the pool while we were booting; the machine is
            // registered, so the manager stop path tears it down.
            debug!(vmid = %vmid, "pool closed during enqueue");
        }
        Ok(())
    }

    /// Poll the handshake table until this machine says hello or the
    /// deadline passes. The very first machine that fails its handshake
    /// cancels the whole node: that failure is near-certainly a node-level
    /// misconfiguration, not a one-off.
    async fn await_handshake(self: Arc<Self>, vmid: String) {
        let timeout = self.config.timeouts.handshake();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.stopping() || self.cancel.is_cancelled() {
                return;
            }
            if self.registry.handshake_seen(&vmid) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(RUNLOOP_SLEEP).await;
        }

        let err = NodeError::HandshakeTimeout(vmid.clone(), timeout);
        error!(vmid = %vmid, error = %err, "agent never completed its handshake");
        self.events
            .publish(
                SYSTEM_NAMESPACE,
                NodeEvent::HandshakeTimedOut {
                    machine_id: vmid.clone(),
                },
            )
            .await;

        if self.config.strict_first_handshake && self.registry.handshake_count() == 0 {
            error!("first handshake failed, shutting down to avoid inconsistent behavior");
            self.cancel.cancel();
            return;
        }

        if let Some(machine) = self.registry.lookup(&vmid) {
            machine.set_state(MachineState::FailedBoot);
        }
        if let Err(e) = self.stop_machine(&vmid, false).await {
            debug!(vmid = %vmid, error = %e, "failed-boot machine already gone");
        }
    }

    /// Dequeue the next usable warm machine. Skips machines the watchdog
    /// dropped while they sat in the queue; returns None once the node is
    /// shutting down.
    pub async fn take_warm_machine(&self) -> Option<Arc<Machine>> {
        loop {
            let machine = self.pool.take().await?;
            if self.stopping() {
                return None;
            }
            if self.registry.lookup(&machine.id).is_some() {
                return Some(machine);
            }
            debug!(vmid = %machine.id, "skipping machine dropped while queued");
        }
    }

    /// Bind a validated deploy request to a warm machine and hand the
    /// workload to its agent. On rejection or partial failure the machine is
    /// stopped; the caller only has to surface the error.
    pub async fn deploy_workload(
        &self,
        machine: &Arc<Machine>,
        namespace: &str,
        request: DeployRequest,
    ) -> Result<(), NodeError> {
        let vmid = machine.id.clone();
        if self.registry.lookup(&vmid).is_none() {
            return Err(NodeError::NotFound(vmid));
        }

        let payload = serde_json::to_vec(&request)?;
        machine.bind_deployment(request.clone(), namespace);

        debug!(vmid = %vmid, workload = %request.workload_name, "submitting deploy request to agent");
        let reply = match self
            .internal
            .request(&deploy_subject(&vmid), payload, self.config.timeouts.deploy())
            .await
        {
            Ok(reply) => reply,
            Err(BusError::Timeout(_)) | Err(BusError::NoReply(_)) => {
                return Err(NodeError::DeployTimeout(vmid));
            }
            Err(e) => {
                return Err(NodeError::Internal(format!(
                    "failed to submit deploy request: {e}"
                )));
            }
        };

        let response: DeployResponse = serde_json::from_slice(&reply.payload)?;
        if !response.accepted {
            let reason = response
                .message
                .unwrap_or_else(|| "no reason given".to_string());
            let _ = self.stop_machine(&vmid, false).await;
            return Err(NodeError::AgentRejected(reason));
        }

        machine.set_state(MachineState::Deployed);
        self.telemetry.workload_deployed(
            &request.workload_type.to_string(),
            namespace,
            request.total_bytes,
            machine.vcpus,
            machine.memory_mib,
        );

        if request.supports_trigger_subjects() {
            for tsub in &request.trigger_subjects {
                let router = Arc::new(TriggerRouter::new(
                    self.internal.clone(),
                    self.events.clone(),
                    self.telemetry.clone(),
                    vmid.clone(),
                    namespace.to_string(),
                    request.workload_name.clone(),
                    request.workload_type,
                    self.config.timeouts.trigger(),
                ));
                match self.external.subscribe(tsub, router).await {
                    Ok(sub) => {
                        info!(
                            vmid = %vmid,
                            trigger_subject = %tsub,
                            workload_type = %request.workload_type,
                            "created trigger subscription for deployed workload"
                        );
                        machine.add_subscription(sub);
                    }
                    Err(e) => {
                        error!(
                            vmid = %vmid,
                            trigger_subject = %tsub,
                            workload_type = %request.workload_type,
                            error = %e,
                            "failed to create trigger subscription for deployed workload"
                        );
                        let _ = self.stop_machine(&vmid, true).await;
                        return Err(NodeError::SubscribeFailed {
                            subject: tsub.clone(),
                            source: e,
                        });
                    }
                }
            }
        }

        info!(
            vmid = %vmid,
            workload = %request.workload_name,
            namespace,
            "workload deployed"
        );
        Ok(())
    }

    /// Tear down one machine: drain its trigger subscriptions, optionally
    /// ask the agent to undeploy gracefully, stop the hypervisor, and remove
    /// every trace from the registry. Drain and undeploy failures are logged
    /// but never block teardown.
    pub async fn stop_machine(&self, machine_id: &str, undeploy: bool) -> Result<(), NodeError> {
        let machine = self
            .registry
            .lookup(machine_id)
            .ok_or_else(|| NodeError::NotFound(machine_id.to_string()))?;

        let _guard = machine.lock_for_stop().await;
        // A concurrent stop may have finished while we waited on the lock.
        if self.registry.lookup(machine_id).is_none() {
            return Err(NodeError::NotFound(machine_id.to_string()));
        }

        debug!(vmid = %machine_id, undeploy, "stopping machine");
        let deployment = machine.deployment();
        let was_deployed = machine.state() == MachineState::Deployed;

        machine.set_state(MachineState::Draining);
        for sub in machine.take_subscriptions() {
            let subject = sub.subject().to_string();
            sub.drain().await;
            debug!(vmid = %machine_id, subject, "drained trigger subscription");
        }

        if undeploy && was_deployed {
            machine.set_state(MachineState::Undeploying);
            if let Err(e) = self
                .internal
                .request(
                    &undeploy_subject(machine_id),
                    Vec::new(),
                    self.config.timeouts.undeploy(),
                )
                .await
            {
                warn!(vmid = %machine_id, error = %e, "graceful undeploy request failed");
            }
        }

        machine.set_state(MachineState::Stopping);
        if let Err(e) = machine.backend().shutdown().await {
            warn!(vmid = %machine_id, error = %e, "hypervisor teardown reported an error");
        }

        self.registry.remove(machine_id);

        let namespace = deployment
            .as_ref()
            .map(|d| d.namespace.clone())
            .unwrap_or_else(|| SYSTEM_NAMESPACE.to_string());
        self.events
            .publish(
                &namespace,
                NodeEvent::MachineStopped {
                    machine_id: machine_id.to_string(),
                    workload_name: deployment.as_ref().map(|d| d.request.workload_name.clone()),
                },
            )
            .await;

        if was_deployed {
            if let Some(d) = &deployment {
                self.telemetry.workload_stopped(
                    &d.request.workload_type.to_string(),
                    &d.namespace,
                    d.request.total_bytes,
                    machine.vcpus,
                    machine.memory_mib,
                );
            }
        }

        info!(vmid = %machine_id, "machine stopped");
        Ok(())
    }

    /// Stop the whole manager: close the pool, stop every machine, drain
    /// the core subscriptions, and remove stale hypervisor sockets. Runs at
    /// most once; later calls return immediately.
    pub async fn stop(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("machine manager stopping");
        self.pool.close();

        for machine in self.registry.list() {
            if let Err(e) = self.stop_machine(&machine.id, true).await {
                warn!(vmid = %machine.id, error = %e, "failed to stop machine");
            }
        }

        let subs: Vec<Subscription> = {
            let mut guard = self.core_subs.lock().expect("core subscription lock poisoned");
            guard.drain(..).collect()
        };
        for sub in subs {
            sub.drain().await;
        }

        self.clean_sockets();
        info!("machine manager stopped");
    }

    /// Remove hypervisor control sockets created by this process. Sockets
    /// belonging to other node processes on the same host are left alone.
    fn clean_sockets(&self) {
        let temp_dir = std::env::temp_dir();
        let entries = match std::fs::read_dir(&temp_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %temp_dir.display(), error = %e, "failed to read temp directory");
                return;
            }
        };

        let prefix = socket_prefix();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                let path = temp_dir.join(name.as_ref());
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "removed stale hypervisor socket"),
                    Err(e) => debug!(path = %path.display(), error = %e, "failed to remove stale socket"),
                }
            }
        }
    }
}

/// Replies to agent hellos and records first-seen timestamps. The reply is
/// mandatory: a fire-and-forget publish from inside the machine could be
/// lost without proving anything about connectivity.
struct HandshakeIngress {
    registry: Arc<MachineRegistry>,
}

#[async_trait]
impl MessageHandler for HandshakeIngress {
    async fn handle(&self, msg: Message) {
        let request: HandshakeRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "failed to decode agent handshake");
                return;
            }
        };

        if self.registry.lookup(&request.machine_id).is_none() {
            warn!(vmid = %request.machine_id, "handshake attempt from a machine we don't know about");
            return;
        }

        let Ok(reply) = serde_json::to_vec(&HandshakeResponse::default()) else {
            return;
        };
        if !msg.respond(reply) {
            error!(vmid = %request.machine_id, "failed to reply to agent handshake");
            return;
        }

        self.registry.record_handshake(&request.machine_id);
        info!(vmid = %request.machine_id, "agent handshake complete");
    }
}
