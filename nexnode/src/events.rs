//! Lifecycle events published on the external bus, plus the relays that
//! forward agent-emitted events and logs out of the internal bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nex_control_api::{EVENT_SUBJECT_PREFIX, LOG_SUBJECT_PREFIX};

use crate::bus::{Bus, Message, MessageHandler};
use crate::machine::MachineRegistry;

/// Namespace used for events about machines not bound to any workload.
pub const SYSTEM_NAMESPACE: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum NodeEvent {
    MachineStopped {
        machine_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workload_name: Option<String>,
    },
    FunctionExecSucceeded {
        machine_id: String,
        workload_name: String,
        trigger_subject: String,
        runtime_ns: u64,
    },
    FunctionExecFailed {
        machine_id: String,
        workload_name: String,
        trigger_subject: String,
        error: String,
    },
    HandshakeTimedOut {
        machine_id: String,
    },
}

impl NodeEvent {
    /// Subject token identifying the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::MachineStopped { .. } => "machine_stopped",
            NodeEvent::FunctionExecSucceeded { .. } => "function_exec_succeeded",
            NodeEvent::FunctionExecFailed { .. } => "function_exec_failed",
            NodeEvent::HandshakeTimedOut { .. } => "handshake_timed_out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: NodeEvent,
}

/// Best-effort publisher of node lifecycle events; failures are logged,
/// never propagated.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Bus,
}

impl EventPublisher {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, namespace: &str, event: NodeEvent) {
        let subject = format!("{EVENT_SUBJECT_PREFIX}.{namespace}.{}", event.kind());
        let envelope = EventEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode node event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&subject, payload).await {
            debug!(subject, error = %e, "failed to publish node event");
        }
    }
}

// ---------------------------------------------------------------------------
// Agent event/log relays (internal bus -> external bus)
// ---------------------------------------------------------------------------

/// Forwards `agentint.<vmid>.events.<type>` publications to
/// `$NEX.events.<namespace>.<type>`.
pub struct AgentEventRelay {
    pub registry: Arc<MachineRegistry>,
    pub external: Bus,
}

#[async_trait]
impl MessageHandler for AgentEventRelay {
    async fn handle(&self, msg: Message) {
        let Some((machine_id, event_type)) = parse_agent_event_subject(&msg.subject) else {
            warn!(subject = %msg.subject, "malformed agent event subject");
            return;
        };
        let namespace = self.namespace_of(machine_id);
        let subject = format!("{EVENT_SUBJECT_PREFIX}.{namespace}.{event_type}");
        if let Err(e) = self.external.publish(&subject, msg.payload.clone()).await {
            debug!(subject, error = %e, "failed to relay agent event");
        }
    }
}

impl AgentEventRelay {
    fn namespace_of(&self, machine_id: &str) -> String {
        self.registry
            .lookup(machine_id)
            .and_then(|m| m.namespace())
            .unwrap_or_else(|| SYSTEM_NAMESPACE.to_string())
    }
}

/// Forwards `agentint.<vmid>.logs` publications to
/// `$NEX.logs.<namespace>.<vmid>`.
pub struct AgentLogRelay {
    pub registry: Arc<MachineRegistry>,
    pub external: Bus,
}

#[async_trait]
impl MessageHandler for AgentLogRelay {
    async fn handle(&self, msg: Message) {
        let Some(machine_id) = parse_agent_log_subject(&msg.subject) else {
            warn!(subject = %msg.subject, "malformed agent log subject");
            return;
        };
        let namespace = self
            .registry
            .lookup(machine_id)
            .and_then(|m| m.namespace())
            .unwrap_or_else(|| SYSTEM_NAMESPACE.to_string());
        let subject = format!("{LOG_SUBJECT_PREFIX}.{namespace}.{machine_id}");
        if let Err(e) = self.external.publish(&subject, msg.payload.clone()).await {
            debug!(subject, error = %e, "failed to relay agent log line");
        }
    }
}

/// `agentint.<vmid>.events.<type>` -> (vmid, type)
fn parse_agent_event_subject(subject: &str) -> Option<(&str, &str)> {
    let mut tokens = subject.split('.');
    (tokens.next() == Some("agentint")).then_some(())?;
    let machine_id = tokens.next()?;
    (tokens.next() == Some("events")).then_some(())?;
    let event_type = tokens.next()?;
    tokens.next().is_none().then_some((machine_id, event_type))
}

/// `agentint.<vmid>.logs` -> vmid
fn parse_agent_log_subject(subject: &str) -> Option<&str> {
    let mut tokens = subject.split('.');
    (tokens.next() == Some("agentint")).then_some(())?;
    let machine_id = tokens.next()?;
    (tokens.next() == Some("logs")).then_some(())?;
    tokens.next().is_none().then_some(machine_id)
}
