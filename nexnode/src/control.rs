//! Control API listener: the command surface of the node.
//!
//! Subscribes under the `$NEX.` prefix for ping, info, run, and stop
//! operations. Signed-token verification happens upstream; this layer
//! enforces what the node itself must not get wrong: supported workload
//! types, trigger capability, the issuer allow-list, and namespace
//! isolation. Every response is a success/failure envelope with a
//! diagnostic reason.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use nex_control_api::{
    extract_namespace, humanize_uptime, info_pattern, node_ping_subject, ping_subject,
    run_pattern, stop_pattern, validate_issuer, Envelope, InfoResponse, MachineSummary,
    PingResponse, RunRequest, RunResponse, StopRequest, StopResponse, WorkloadSummary,
    INFO_RESPONSE_TYPE, PING_RESPONSE_TYPE, RUN_RESPONSE_TYPE, STOP_RESPONSE_TYPE, TAG_ARCH,
    TAG_CPUCOUNT, TAG_OS,
};

use crate::bus::{Bus, Message, MessageHandler, Subscription};
use crate::config::NodeConfig;
use crate::machine::{MachineManager, MachineRegistry, MachineState, NodeError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The command and control interface for the node.
pub struct ApiListener {
    shared: Arc<ListenerShared>,
    bus: Bus,
    subs: Mutex<Vec<Subscription>>,
}

struct ListenerShared {
    manager: Arc<MachineManager>,
    config: NodeConfig,
    node_id: String,
    started_at: DateTime<Utc>,
}

impl ApiListener {
    pub fn new(
        manager: Arc<MachineManager>,
        mut config: NodeConfig,
        node_id: String,
        bus: Bus,
    ) -> Self {
        // Advertise the platform next to whatever tags the operator set.
        config
            .tags
            .insert(TAG_OS.to_string(), std::env::consts::OS.to_string());
        config
            .tags
            .insert(TAG_ARCH.to_string(), std::env::consts::ARCH.to_string());
        config.tags.insert(
            TAG_CPUCOUNT.to_string(),
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .to_string(),
        );

        Self {
            shared: Arc::new(ListenerShared {
                manager,
                config,
                node_id,
                started_at: Utc::now(),
            }),
            bus,
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Install the control subject subscriptions.
    pub async fn start(&self) -> Result<(), NodeError> {
        let node_id = self.shared.node_id.clone();
        let subjects = [
            ping_subject(),
            node_ping_subject(&node_id),
            info_pattern(&node_id),
            run_pattern(&node_id),
            stop_pattern(&node_id),
        ];
        let handlers: [Arc<dyn MessageHandler>; 5] = [
            Arc::new(PingHandler {
                shared: self.shared.clone(),
            }),
            Arc::new(PingHandler {
                shared: self.shared.clone(),
            }),
            Arc::new(InfoHandler {
                shared: self.shared.clone(),
            }),
            Arc::new(RunHandler {
                shared: self.shared.clone(),
            }),
            Arc::new(StopHandler {
                shared: self.shared.clone(),
            }),
        ];

        let mut created = Vec::new();
        for (subject, handler) in subjects.into_iter().zip(handlers) {
            let sub = self
                .bus
                .subscribe(&subject, handler)
                .await
                .map_err(|e| NodeError::SubscribeFailed {
                    subject: subject.clone(),
                    source: e,
                })?;
            created.push(sub);
        }
        self.subs
            .lock()
            .expect("listener subscription lock poisoned")
            .extend(created);

        info!(node_id = %node_id, version = VERSION, "execution engine awaiting commands");
        Ok(())
    }

    /// Drain the control subscriptions; in-flight handlers finish first.
    pub async fn drain(&self) {
        let subs: Vec<Subscription> = {
            let mut guard = self.subs.lock().expect("listener subscription lock poisoned");
            guard.drain(..).collect()
        };
        for sub in subs {
            sub.drain().await;
        }
    }
}

fn respond_envelope<T: Serialize>(msg: &Message, envelope: &Envelope<T>) {
    match serde_json::to_vec(envelope) {
        Ok(raw) => {
            if !msg.respond(raw) {
                warn!(subject = %msg.subject, "control request carried no reply slot");
            }
        }
        Err(e) => error!(error = %e, "failed to encode control response"),
    }
}

fn respond_fail(msg: &Message, response_type: &str, reason: String) {
    respond_envelope(msg, &Envelope::<()>::fail(response_type, reason));
}

fn uptime_since(start: DateTime<Utc>) -> String {
    humanize_uptime((Utc::now() - start).to_std().unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

struct PingHandler {
    shared: Arc<ListenerShared>,
}

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, msg: Message) {
        let response = PingResponse {
            node_id: self.shared.node_id.clone(),
            version: VERSION.to_string(),
            uptime: uptime_since(self.shared.started_at),
            running_machines: self.shared.manager.registry().len(),
            tags: self.shared.config.tags.clone(),
        };
        respond_envelope(&msg, &Envelope::ok(PING_RESPONSE_TYPE, response));
    }
}

struct InfoHandler {
    shared: Arc<ListenerShared>,
}

#[async_trait]
impl MessageHandler for InfoHandler {
    async fn handle(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns.to_string(),
            Err(e) => {
                error!(error = %e, "failed to extract namespace for info request");
                respond_fail(
                    &msg,
                    INFO_RESPONSE_TYPE,
                    "Failed to extract namespace for info request".to_string(),
                );
                return;
            }
        };

        let response = InfoResponse {
            version: VERSION.to_string(),
            uptime: uptime_since(self.shared.started_at),
            tags: self.shared.config.tags.clone(),
            supported_workload_types: self.shared.config.workload_types.clone(),
            machines: summarize_machines(&self.shared.manager.registry(), &namespace),
        };
        respond_envelope(&msg, &Envelope::ok(INFO_RESPONSE_TYPE, response));
    }
}

fn summarize_machines(registry: &MachineRegistry, namespace: &str) -> Vec<MachineSummary> {
    let now = Utc::now();
    registry
        .list()
        .into_iter()
        .filter_map(|machine| {
            let deployment = machine.deployment()?;
            if deployment.namespace != namespace {
                return None;
            }
            Some(MachineSummary {
                id: machine.id.clone(),
                healthy: machine.state() == MachineState::Deployed,
                uptime: humanize_uptime((now - machine.started_at).to_std().unwrap_or_default()),
                workload: WorkloadSummary {
                    name: deployment.request.workload_name.clone(),
                    description: deployment.request.description.clone(),
                    runtime: humanize_uptime(
                        (now - deployment.started_at).to_std().unwrap_or_default(),
                    ),
                    workload_type: deployment.request.workload_type,
                },
            })
        })
        .collect()
}

struct RunHandler {
    shared: Arc<ListenerShared>,
}

#[async_trait]
impl MessageHandler for RunHandler {
    async fn handle(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns.to_string(),
            Err(e) => {
                error!(error = %e, "invalid subject for workload run");
                respond_fail(
                    &msg,
                    RUN_RESPONSE_TYPE,
                    "Invalid subject for workload run".to_string(),
                );
                return;
            }
        };

        let request: RunRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "failed to deserialize run request");
                respond_fail(
                    &msg,
                    RUN_RESPONSE_TYPE,
                    format!("Unable to deserialize run request: {e}"),
                );
                return;
            }
        };

        if !self
            .shared
            .config
            .workload_types
            .contains(&request.workload_type)
        {
            error!(workload_type = %request.workload_type, "unsupported workload type");
            respond_fail(
                &msg,
                RUN_RESPONSE_TYPE,
                format!(
                    "Unsupported workload type on this node: {}",
                    request.workload_type
                ),
            );
            return;
        }

        if !request.trigger_subjects.is_empty() && !request.workload_type.supports_triggers() {
            error!(workload_type = %request.workload_type, "workload type cannot register trigger subjects");
            respond_fail(
                &msg,
                RUN_RESPONSE_TYPE,
                format!(
                    "Unsupported workload type for trigger subject registration: {}",
                    request.workload_type
                ),
            );
            return;
        }

        if let Err(e) = request.validate() {
            error!(error = %e, "invalid run request");
            respond_fail(&msg, RUN_RESPONSE_TYPE, format!("Invalid run request: {e}"));
            return;
        }

        if !validate_issuer(&request.claims.issuer, &self.shared.config.valid_issuers) {
            error!(issuer = %request.claims.issuer, "workload issuer not in allow-list");
            respond_fail(
                &msg,
                RUN_RESPONSE_TYPE,
                format!("Invalid workload issuer: {}", request.claims.issuer),
            );
            return;
        }

        let Some(machine) = self.shared.manager.take_warm_machine().await else {
            error!("no warm machine available");
            respond_fail(
                &msg,
                RUN_RESPONSE_TYPE,
                "Failed to pull warm machine from ready pool".to_string(),
            );
            return;
        };

        let workload_name = request.claims.subject.clone();
        info!(
            vmid = %machine.id,
            namespace = %namespace,
            workload = %workload_name,
            workload_type = %request.workload_type,
            "submitting workload to machine"
        );

        match self
            .shared
            .manager
            .deploy_workload(&machine, &namespace, request.to_deploy_request())
            .await
        {
            Ok(()) => {
                info!(vmid = %machine.id, workload = %workload_name, "work accepted");
                respond_envelope(
                    &msg,
                    &Envelope::ok(
                        RUN_RESPONSE_TYPE,
                        RunResponse {
                            started: true,
                            name: workload_name,
                            issuer: request.claims.issuer.clone(),
                            machine_id: machine.id.clone(),
                        },
                    ),
                );
            }
            Err(e) => {
                error!(vmid = %machine.id, error = %e, "failed to start workload in machine");
                // Bounded rollback: the deploy paths that already stopped the
                // machine make this a no-op.
                if let Err(stop_err) = self.shared.manager.stop_machine(&machine.id, false).await {
                    if !matches!(stop_err, NodeError::NotFound(_)) {
                        warn!(vmid = %machine.id, error = %stop_err, "rollback stop failed");
                    }
                }
                respond_fail(&msg, RUN_RESPONSE_TYPE, format!("Unable to start workload: {e}"));
            }
        }
    }
}

struct StopHandler {
    shared: Arc<ListenerShared>,
}

#[async_trait]
impl MessageHandler for StopHandler {
    async fn handle(&self, msg: Message) {
        let namespace = match extract_namespace(&msg.subject) {
            Ok(ns) => ns.to_string(),
            Err(e) => {
                error!(error = %e, "invalid subject for workload stop");
                respond_fail(
                    &msg,
                    STOP_RESPONSE_TYPE,
                    "Invalid subject for workload stop".to_string(),
                );
                return;
            }
        };

        let request: StopRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "failed to deserialize stop request");
                respond_fail(
                    &msg,
                    STOP_RESPONSE_TYPE,
                    format!("Unable to deserialize stop request: {e}"),
                );
                return;
            }
        };

        let Some(machine) = self.shared.manager.lookup(&request.workload_id) else {
            error!(vmid = %request.workload_id, "stop request for unknown workload");
            respond_fail(&msg, STOP_RESPONSE_TYPE, "No such workload".to_string());
            return;
        };

        let Some(deployment) = machine.deployment() else {
            respond_fail(&msg, STOP_RESPONSE_TYPE, "No such workload".to_string());
            return;
        };

        if deployment.namespace != namespace {
            warn!(
                namespace = %deployment.namespace,
                target_namespace = %namespace,
                "namespace mismatch on workload stop request"
            );
            // Same reply as an unknown id so existence cannot be probed
            // across namespaces.
            respond_fail(&msg, STOP_RESPONSE_TYPE, "No such workload".to_string());
            return;
        }

        if let Err(e) = request.validate(&deployment.request.claims) {
            error!(error = %e, "failed to validate stop request");
            respond_fail(&msg, STOP_RESPONSE_TYPE, format!("Invalid stop request: {e}"));
            return;
        }

        if let Err(e) = self
            .shared
            .manager
            .stop_machine(&request.workload_id, true)
            .await
        {
            error!(vmid = %request.workload_id, error = %e, "failed to stop workload");
            respond_fail(&msg, STOP_RESPONSE_TYPE, format!("Failed to stop workload: {e}"));
            return;
        }

        respond_envelope(
            &msg,
            &Envelope::ok(
                STOP_RESPONSE_TYPE,
                StopResponse {
                    stopped: true,
                    name: deployment.request.claims.subject.clone(),
                    issuer: deployment.request.claims.issuer.clone(),
                    machine_id: request.workload_id.clone(),
                },
            ),
        );
    }
}
