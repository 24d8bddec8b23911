//! Wire types for the control plane the node listens on.
//!
//! Control subjects live under the `$NEX.` prefix and carry the tenant
//! namespace as a subject token, e.g. `$NEX.RUN.<namespace>.<nodeId>`.
//! Every response is wrapped in an [`Envelope`] so callers can distinguish
//! success from failure without sniffing payload shapes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nex_agent_api::{DeployRequest, WorkloadClaims, WorkloadKind};

/// Prefix of every control API subject.
pub const API_PREFIX: &str = "$NEX";

/// Prefix the node publishes lifecycle events under.
pub const EVENT_SUBJECT_PREFIX: &str = "$NEX.events";

/// Prefix the node relays workload log lines under.
pub const LOG_SUBJECT_PREFIX: &str = "$NEX.logs";

pub const PING_RESPONSE_TYPE: &str = "ping_response";
pub const INFO_RESPONSE_TYPE: &str = "info_response";
pub const RUN_RESPONSE_TYPE: &str = "run_response";
pub const STOP_RESPONSE_TYPE: &str = "stop_response";

/// Well-known tags every node advertises alongside operator-defined ones.
pub const TAG_OS: &str = "nex.os";
pub const TAG_ARCH: &str = "nex.arch";
pub const TAG_CPUCOUNT: &str = "nex.cpucount";

#[derive(Debug, Error)]
pub enum ControlApiError {
    #[error("invalid control subject: {0}")]
    InvalidSubject(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Broadcast ping subject answered by every node.
pub fn ping_subject() -> String {
    format!("{API_PREFIX}.PING")
}

/// Ping subject addressed to a single node.
pub fn node_ping_subject(node_id: &str) -> String {
    format!("{API_PREFIX}.PING.{node_id}")
}

/// Subscription pattern for namespaced info requests to one node.
pub fn info_pattern(node_id: &str) -> String {
    format!("{API_PREFIX}.INFO.*.{node_id}")
}

/// Subscription pattern for namespaced run requests to one node.
pub fn run_pattern(node_id: &str) -> String {
    format!("{API_PREFIX}.RUN.*.{node_id}")
}

/// Subscription pattern for namespaced stop requests to one node.
pub fn stop_pattern(node_id: &str) -> String {
    format!("{API_PREFIX}.STOP.*.{node_id}")
}

/// Concrete subject a client uses to run a workload in a namespace.
pub fn run_subject(namespace: &str, node_id: &str) -> String {
    format!("{API_PREFIX}.RUN.{namespace}.{node_id}")
}

/// Concrete subject a client uses to stop a workload in a namespace.
pub fn stop_subject(namespace: &str, node_id: &str) -> String {
    format!("{API_PREFIX}.STOP.{namespace}.{node_id}")
}

/// Concrete subject a client uses to query a namespace on one node.
pub fn info_subject(namespace: &str, node_id: &str) -> String {
    format!("{API_PREFIX}.INFO.{namespace}.{node_id}")
}

/// Pull the tenant namespace out of a namespaced control subject
/// (`$NEX.<op>.<namespace>...`).
pub fn extract_namespace(subject: &str) -> Result<&str, ControlApiError> {
    let mut tokens = subject.split('.');
    let prefix = tokens.next();
    let _op = tokens.next();
    let namespace = tokens.next();
    match (prefix, namespace) {
        (Some(API_PREFIX), Some(ns)) if !ns.is_empty() => Ok(ns),
        _ => Err(ControlApiError::InvalidSubject(subject.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Uniform response wrapper: either `data` or `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(response_type: &str, data: T) -> Self {
        Self {
            response_type: response_type.to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(response_type: &str, reason: impl Into<String>) -> Self {
        Self {
            response_type: response_type.to_string(),
            data: None,
            error: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A validated request to run a workload on this node. The control-plane
/// validator has already decoded the signed token into `claims` before the
/// node sees this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub workload_type: WorkloadKind,
    /// Where the workload artifact can be fetched from.
    pub location: String,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub trigger_subjects: Vec<String>,
    pub claims: WorkloadClaims,
}

impl RunRequest {
    /// Structural validation of what the upstream decoder handed us.
    pub fn validate(&self) -> Result<(), ControlApiError> {
        if self.claims.subject.is_empty() {
            return Err(ControlApiError::InvalidRequest(
                "claims carry no workload name".to_string(),
            ));
        }
        if self.claims.hash.is_empty() {
            return Err(ControlApiError::InvalidRequest(
                "claims carry no workload hash".to_string(),
            ));
        }
        if self.claims.workload_type != self.workload_type {
            return Err(ControlApiError::InvalidRequest(format!(
                "request workload type {} does not match claims type {}",
                self.workload_type, self.claims.workload_type
            )));
        }
        if self.location.is_empty() {
            return Err(ControlApiError::InvalidRequest(
                "no workload location provided".to_string(),
            ));
        }
        Ok(())
    }

    /// The canonical deploy request submitted to the in-guest agent.
    pub fn to_deploy_request(&self) -> DeployRequest {
        DeployRequest {
            workload_name: self.claims.subject.clone(),
            workload_type: self.workload_type,
            description: self.description.clone(),
            total_bytes: self.total_bytes,
            hash: self.claims.hash.clone(),
            location: self.location.clone(),
            environment: self.environment.clone(),
            trigger_subjects: self.trigger_subjects.clone(),
            claims: self.claims.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub started: bool,
    pub name: String,
    pub issuer: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub workload_id: String,
    pub workload_name: String,
    pub issuer: String,
}

impl StopRequest {
    /// A stop must name the workload and issuer recorded in the claims the
    /// workload was deployed under.
    pub fn validate(&self, claims: &WorkloadClaims) -> Result<(), ControlApiError> {
        if self.workload_name != claims.subject {
            return Err(ControlApiError::InvalidRequest(format!(
                "workload name {} does not match deployment",
                self.workload_name
            )));
        }
        if self.issuer != claims.issuer {
            return Err(ControlApiError::InvalidRequest(format!(
                "issuer {} does not match deployment",
                self.issuer
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub name: String,
    pub issuer: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: String,
    pub version: String,
    pub uptime: String,
    pub running_machines: usize,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub version: String,
    pub uptime: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub supported_workload_types: Vec<WorkloadKind>,
    pub machines: Vec<MachineSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    pub id: String,
    pub healthy: bool,
    pub uptime: String,
    pub workload: WorkloadSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub runtime: String,
    pub workload_type: WorkloadKind,
}

/// An empty issuer allow-list admits every issuer.
pub fn validate_issuer(issuer: &str, valid_issuers: &[String]) -> bool {
    valid_issuers.is_empty() || valid_issuers.iter().any(|i| i == issuer)
}

/// Render a duration the way the NATS server renders uptime, for consistency
/// with the rest of the ecosystem's tooling.
pub fn humanize_uptime(d: Duration) -> String {
    let tsecs = d.as_secs();
    let tmins = tsecs / 60;
    let thrs = tmins / 60;
    let tdays = thrs / 24;
    let tyrs = tdays / 365;

    if tyrs > 0 {
        format!(
            "{}y{}d{}h{}m{}s",
            tyrs,
            tdays % 365,
            thrs % 24,
            tmins % 60,
            tsecs % 60
        )
    } else if tdays > 0 {
        format!("{}d{}h{}m{}s", tdays, thrs % 24, tmins % 60, tsecs % 60)
    } else if thrs > 0 {
        format!("{}h{}m{}s", thrs, tmins % 60, tsecs % 60)
    } else if tmins > 0 {
        format!("{}m{}s", tmins, tsecs % 60)
    } else {
        format!("{}s", tsecs)
    }
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

    fn run_request() -> RunRequest {
        RunRequest {
            workload_type: WorkloadKind::V8,
            location: "oci://registry/echofn".to_string(),
            total_bytes: 2048,
            description: Some("echo".to_string()),
            environment: HashMap::new(),
            trigger_subjects: vec!["t.a".to_string()],
            claims: claims(),
        }
    }

    #[test]
    fn namespace_extraction() {
        assert_eq!(extract_namespace("$NEX.RUN.default.node1").unwrap(), "default");
        assert_eq!(extract_namespace("$NEX.STOP.tenant-a.node1").unwrap(), "tenant-a");
        assert!(extract_namespace("$NEX.PING").is_err());
        assert!(extract_namespace("RUN.default.node1").is_err());
        assert!(extract_namespace("$NEX.RUN..node1").is_err());
    }

    #[test]
    fn subject_helpers_match_patterns() {
        assert_eq!(run_pattern("node1"), "$NEX.RUN.*.node1");
        assert_eq!(run_subject("default", "node1"), "$NEX.RUN.default.node1");
        assert_eq!(stop_pattern("node1"), "$NEX.STOP.*.node1");
        assert_eq!(info_subject("default", "node1"), "$NEX.INFO.default.node1");
        assert_eq!(node_ping_subject("node1"), "$NEX.PING.node1");
    }

    #[test]
    fn envelope_carries_data_xor_error() {
        let ok = Envelope::ok(RUN_RESPONSE_TYPE, 42u32);
        assert_eq!(ok.data, Some(42));
        assert!(ok.error.is_none());

        let fail = Envelope::<u32>::fail(RUN_RESPONSE_TYPE, "nope");
        assert!(fail.data.is_none());
        assert_eq!(fail.error.as_deref(), Some("nope"));

        let raw = serde_json::to_string(&fail).unwrap();
        assert!(raw.contains("\"type\":\"run_response\""));
        assert!(!raw.contains("data"));
    }

    #[test]
    fn run_request_validation() {
        assert!(run_request().validate().is_ok());

        let mut bad = run_request();
        bad.claims.subject.clear();
        assert!(bad.validate().is_err());

        let mut bad = run_request();
        bad.workload_type = WorkloadKind::Wasm;
        assert!(bad.validate().is_err());

        let mut bad = run_request();
        bad.location.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn run_request_becomes_deploy_request() {
        let deploy = run_request().to_deploy_request();
        assert_eq!(deploy.workload_name, "echofn");
        assert_eq!(deploy.hash, "abc123");
        assert_eq!(deploy.trigger_subjects, vec!["t.a"]);
        assert!(deploy.supports_trigger_subjects());
    }

    #[test]
    fn stop_request_must_match_claims() {
        let stop = StopRequest {
            workload_id: "vm-1".to_string(),
            workload_name: "echofn".to_string(),
            issuer: "AISSUER".to_string(),
        };
        assert!(stop.validate(&claims()).is_ok());

        let wrong_name = StopRequest {
            workload_name: "other".to_string(),
            ..stop.clone()
        };
        assert!(wrong_name.validate(&claims()).is_err());

        let wrong_issuer = StopRequest {
            issuer: "AEVIL".to_string(),
            ..stop
        };
        assert!(wrong_issuer.validate(&claims()).is_err());
    }

    #[test]
    fn empty_issuer_list_admits_everyone() {
        assert!(validate_issuer("ANYONE", &[]));
        let allowed = vec!["AISSUER".to_string()];
        assert!(validate_issuer("AISSUER", &allowed));
        assert!(!validate_issuer("AEVIL", &allowed));
    }

    #[test]
    fn uptime_rendering_matches_nats_style() {
        assert_eq!(humanize_uptime(Duration::from_secs(12)), "12s");
        assert_eq!(humanize_uptime(Duration::from_secs(62)), "1m2s");
        assert_eq!(humanize_uptime(Duration::from_secs(3_723)), "1h2m3s");
        assert_eq!(humanize_uptime(Duration::from_secs(90_061)), "1d1h1m1s");
        assert_eq!(
            humanize_uptime(Duration::from_secs(366 * 24 * 3600)),
            "1y1d0h0m0s"
        );
    }
}
