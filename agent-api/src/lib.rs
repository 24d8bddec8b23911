//! Wire types for the internal message bus between the node host and the
//! agent running inside each microVM.
//!
//! Every payload is JSON. Subjects are dot-separated and scoped under the
//! `agentint.` prefix; the per-machine subjects embed the machine id so the
//! host can address one agent among many sharing the internal bus.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subject the agent publishes its first hello on, as a request so the host
/// reply proves full round-trip connectivity.
pub const HANDSHAKE_SUBJECT: &str = "agentint.handshake";

/// Wildcard pattern covering agent-emitted lifecycle events.
pub const AGENT_EVENT_PATTERN: &str = "agentint.*.events.*";

/// Wildcard pattern covering agent-emitted log lines.
pub const AGENT_LOG_PATTERN: &str = "agentint.*.logs";

/// Header carrying the external subject that triggered a workload invocation.
pub const HEADER_TRIGGER_SUBJECT: &str = "x-nex-trigger-subject";

/// Header on trigger replies carrying the workload run time in nanoseconds.
pub const HEADER_RUNTIME_NS: &str = "x-nex-runtime-ns";

/// Subject for submitting a deploy request to one agent.
pub fn deploy_subject(machine_id: &str) -> String {
    format!("agentint.{machine_id}.deploy")
}

/// Subject for asking one agent to gracefully undeploy its workload.
pub fn undeploy_subject(machine_id: &str) -> String {
    format!("agentint.{machine_id}.undeploy")
}

/// Subject for forwarding a trigger invocation to one agent.
pub fn trigger_subject(machine_id: &str) -> String {
    format!("agentint.{machine_id}.trigger")
}

/// Subject an agent publishes a lifecycle event on.
pub fn agent_event_subject(machine_id: &str, event_type: &str) -> String {
    format!("agentint.{machine_id}.events.{event_type}")
}

/// Subject an agent publishes log lines on.
pub fn agent_log_subject(machine_id: &str) -> String {
    format!("agentint.{machine_id}.logs")
}

// ---------------------------------------------------------------------------
// Workload typing
// ---------------------------------------------------------------------------

/// The kind of executable artifact a workload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// A statically linked native executable.
    Elf,
    /// A JavaScript function executed by the agent's V8 runtime.
    V8,
    /// A WebAssembly module.
    Wasm,
}

impl WorkloadKind {
    /// Only function-style workloads can be invoked through trigger subjects;
    /// a long-running native service has no request/response entry point.
    pub fn supports_triggers(&self) -> bool {
        matches!(self, WorkloadKind::V8 | WorkloadKind::Wasm)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Elf => write!(f, "elf"),
            WorkloadKind::V8 => write!(f, "v8"),
            WorkloadKind::Wasm => write!(f, "wasm"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown workload kind: {0}")]
pub struct UnknownWorkloadKind(String);

impl FromStr for WorkloadKind {
    type Err = UnknownWorkloadKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elf" => Ok(WorkloadKind::Elf),
            "v8" => Ok(WorkloadKind::V8),
            "wasm" => Ok(WorkloadKind::Wasm),
            other => Err(UnknownWorkloadKind(other.to_string())),
        }
    }
}

/// Claims decoded from the signed workload token by the control-plane
/// validator. The node stores these verbatim; it never re-verifies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadClaims {
    /// Workload name (the token subject).
    pub subject: String,
    /// Public key of the account that signed the workload.
    pub issuer: String,
    /// Content hash of the workload artifact.
    pub hash: String,
    /// Kind of artifact the claims were issued for.
    pub workload_type: WorkloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Public curve key encrypted run requests should be addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_xkey: Option<String>,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First message out of a freshly booted agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Empty envelope; its delivery is the acknowledgement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {}

/// Boot metadata handed to the guest so its agent can find the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineMetadata {
    pub vm_id: String,
    /// Host address of the internal bus the agent must dial.
    pub node_host: String,
    pub node_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

/// The canonical deployment request submitted to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub workload_name: String,
    pub workload_type: WorkloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Total size of the workload artifact in bytes.
    pub total_bytes: u64,
    /// Content hash the agent must verify the artifact against.
    pub hash: String,
    /// Where the agent fetches the artifact from.
    pub location: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// External subjects whose messages invoke the workload.
    #[serde(default)]
    pub trigger_subjects: Vec<String>,
    /// Claims decoded upstream, carried for bookkeeping.
    pub claims: WorkloadClaims,
}

impl DeployRequest {
    /// Whether this request may register trigger subject subscriptions.
    pub fn supports_trigger_subjects(&self) -> bool {
        self.workload_type.supports_triggers() && !self.trigger_subjects.is_empty()
    }
}

/// The agent's verdict on a deployment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> WorkloadClaims {
        WorkloadClaims {
            subject: "echofn".to_string(),
            issuer: "AISSUER".to_string(),
            hash: "abc123".to_string(),
            workload_type: WorkloadKind::V8,
            description: None,
            recipient_xkey: None,
        }
    }

    #[test]
    fn per_machine_subjects_embed_the_id() {
        assert_eq!(deploy_subject("vm-1"), "agentint.vm-1.deploy");
        assert_eq!(undeploy_subject("vm-1"), "agentint.vm-1.undeploy");
        assert_eq!(trigger_subject("vm-1"), "agentint.vm-1.trigger");
        assert_eq!(agent_event_subject("vm-1", "started"), "agentint.vm-1.events.started");
        assert_eq!(agent_log_subject("vm-1"), "agentint.vm-1.logs");
    }

    #[test]
    fn workload_kind_parses_and_displays() {
        for kind in [WorkloadKind::Elf, WorkloadKind::V8, WorkloadKind::Wasm] {
            assert_eq!(kind.to_string().parse::<WorkloadKind>().unwrap(), kind);
        }
        assert!("jar".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn only_function_kinds_support_triggers() {
        assert!(!WorkloadKind::Elf.supports_triggers());
        assert!(WorkloadKind::V8.supports_triggers());
        assert!(WorkloadKind::Wasm.supports_triggers());
    }

    #[test]
    fn workload_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&WorkloadKind::V8).unwrap(), "\"v8\"");
        let kind: WorkloadKind = serde_json::from_str("\"wasm\"").unwrap();
        assert_eq!(kind, WorkloadKind::Wasm);
    }

    #[test]
    fn deploy_request_roundtrip() {
        let req = DeployRequest {
            workload_name: "echofn".to_string(),
            workload_type: WorkloadKind::V8,
            description: Some("echo service".to_string()),
            total_bytes: 1024,
            hash: "abc123".to_string(),
            location: "oci://registry/echofn".to_string(),
            environment: HashMap::from([("MODE".to_string(), "prod".to_string())]),
            trigger_subjects: vec!["t.a".to_string()],
            claims: claims(),
        };
        let raw = serde_json::to_vec(&req).unwrap();
        let back: DeployRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.workload_name, "echofn");
        assert_eq!(back.trigger_subjects, vec!["t.a"]);
        assert_eq!(back.environment["MODE"], "prod");
        assert_eq!(back.claims, claims());
    }

    #[test]
    fn trigger_registration_requires_kind_and_subjects() {
        let mut req = DeployRequest {
            workload_name: "svc".to_string(),
            workload_type: WorkloadKind::Elf,
            description: None,
            total_bytes: 10,
            hash: "h".to_string(),
            location: "file:///tmp/svc".to_string(),
            environment: HashMap::new(),
            trigger_subjects: vec!["t.a".to_string()],
            claims: claims(),
        };
        assert!(!req.supports_trigger_subjects());

        req.workload_type = WorkloadKind::V8;
        assert!(req.supports_trigger_subjects());

        req.trigger_subjects.clear();
        assert!(!req.supports_trigger_subjects());
    }

    #[test]
    fn handshake_response_is_an_empty_envelope() {
        let raw = serde_json::to_string(&HandshakeResponse {}).unwrap();
        assert_eq!(raw, "{}");
        let _: HandshakeResponse = serde_json::from_str("{}").unwrap();
    }
}
