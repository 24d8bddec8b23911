//! In-memory indexes of every live machine on this node.
//!
//! # Locking discipline
//!
//! The registry holds two `RwLock`ed maps (machines, handshake table) that
//! are only ever held for map operations, never across `.await`. Slow
//! teardown work is serialized per machine by [`Machine::lock_for_stop`];
//! a stop takes that lock first and only then touches the registry maps, so
//! the two lock layers can never deadlock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, RwLock};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use nex_agent_api::DeployRequest;

use crate::bus::Subscription;
use crate::firecracker::MachineBackend;

/// Machine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Booted, awaiting the agent's first handshake.
    WarmingUp,
    /// Handshake complete, available in the warm pool.
    Warm,
    /// Bound to a deploy request, awaiting the agent's verdict.
    Deploying,
    /// Running a workload.
    Deployed,
    /// Handshake never arrived; the machine is being discarded.
    FailedBoot,
    /// Stop in progress: trigger subscriptions are being drained.
    Draining,
    /// Stop in progress: graceful undeploy request in flight.
    Undeploying,
    /// Hypervisor teardown in progress.
    Stopping,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::WarmingUp => "warming_up",
            MachineState::Warm => "warm",
            MachineState::Deploying => "deploying",
            MachineState::Deployed => "deployed",
            MachineState::FailedBoot => "failed_boot",
            MachineState::Draining => "draining",
            MachineState::Undeploying => "undeploying",
            MachineState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// A workload binding on a machine.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub request: DeployRequest,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
}

/// One live machine. Resource figures are captured at creation and never
/// change; teardown bookkeeping subtracts exactly what deploy added.
pub struct Machine {
    pub id: String,
    pub ip: IpAddr,
    pub vcpus: u64,
    pub memory_mib: u64,
    pub started_at: DateTime<Utc>,
    backend: Box<dyn MachineBackend>,
    state: RwLock<MachineState>,
    deployment: RwLock<Option<Deployment>>,
    /// Serializes teardown; held for the whole of a stop.
    stop_lock: tokio::sync::Mutex<()>,
    /// Trigger subscriptions registered for the deployed workload.
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Machine {
    pub fn new(id: String, backend: Box<dyn MachineBackend>) -> Self {
        Self {
            ip: backend.ip(),
            vcpus: backend.vcpus(),
            memory_mib: backend.memory_mib(),
            id,
            started_at: Utc::now(),
            backend,
            state: RwLock::new(MachineState::WarmingUp),
            deployment: RwLock::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &dyn MachineBackend {
        self.backend.as_ref()
    }

    pub fn state(&self) -> MachineState {
        *self.state.read().expect("machine state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: MachineState) {
        *self.state.write().expect("machine state lock poisoned") = state;
    }

    /// Bind a deploy request to this machine and enter Deploying.
    pub(crate) fn bind_deployment(&self, request: DeployRequest, namespace: &str) {
        self.set_state(MachineState::Deploying);
        *self.deployment.write().expect("deployment lock poisoned") = Some(Deployment {
            request,
            namespace: namespace.to_string(),
            started_at: Utc::now(),
        });
    }

    /// The current workload binding, if any.
    pub fn deployment(&self) -> Option<Deployment> {
        self.deployment
            .read()
            .expect("deployment lock poisoned")
            .clone()
    }

    /// Namespace of the bound workload, if any.
    pub fn namespace(&self) -> Option<String> {
        self.deployment
            .read()
            .expect("deployment lock poisoned")
            .as_ref()
            .map(|d| d.namespace.clone())
    }

    pub(crate) fn add_subscription(&self, sub: Subscription) {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .push(sub);
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<Subscription> {
        std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .expect("subscription lock poisoned"),
        )
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .len()
    }

    /// Acquire this machine's stop lock for the duration of a teardown.
    pub(crate) async fn lock_for_stop(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.stop_lock.lock().await
    }
}

/// Index of live machines plus the handshake table.
///
/// Handshake entries are never removed: the fatal-first-handshake rule needs
/// to know whether *any* agent has ever reached the host, even if that
/// machine is gone by now.
#[derive(Default)]
pub struct MachineRegistry {
    machines: RwLock<HashMap<String, Arc<Machine>>>,
    handshakes: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, machine: Arc<Machine>) {
        self.machines
            .write()
            .expect("registry lock poisoned")
            .insert(machine.id.clone(), machine);
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Machine>> {
        self.machines
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Machine>> {
        self.machines
            .write()
            .expect("registry lock poisoned")
            .remove(id)
    }

    pub fn list(&self) -> Vec<Arc<Machine>> {
        self.machines
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.machines.read().expect("registry lock poisoned").len()
    }

    #[allow(dead_code)] // public API exercised in tests
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an agent's first hello. Returns false for machines this node
    /// does not know about.
    pub fn record_handshake(&self, id: &str) -> bool {
        let Some(machine) = self.lookup(id) else {
            return false;
        };
        if machine.state() == MachineState::WarmingUp {
            machine.set_state(MachineState::Warm);
        }
        self.handshakes
            .write()
            .expect("handshake lock poisoned")
            .entry(id.to_string())
            .or_insert_with(Utc::now);
        true
    }

    pub fn handshake_seen(&self, id: &str) -> bool {
        self.handshakes
            .read()
            .expect("handshake lock poisoned")
            .contains_key(id)
    }

    /// How many machines have ever completed a handshake on this node.
    pub fn handshake_count(&self) -> usize {
        self.handshakes.read().expect("handshake lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::testutil::NullBackend;

    fn machine(id: &str) -> Arc<Machine> {
        Arc::new(Machine::new(id.to_string(), Box::new(NullBackend::new(2, 512))))
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = MachineRegistry::new();
        assert!(registry.is_empty());

        registry.insert(machine("vm-1"));
        registry.insert(machine("vm-2"));
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("vm-1").is_some());
        assert!(registry.lookup("vm-3").is_none());

        assert!(registry.remove("vm-1").is_some());
        assert!(registry.lookup("vm-1").is_none());
        assert!(registry.remove("vm-1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn machine_captures_backend_resources() {
        let m = machine("vm-1");
        assert_eq!(m.vcpus, 2);
        assert_eq!(m.memory_mib, 512);
        assert_eq!(m.state(), MachineState::WarmingUp);
        assert!(m.deployment().is_none());
        assert!(m.namespace().is_none());
    }

    #[test]
    fn handshake_requires_known_machine() {
        let registry = MachineRegistry::new();
        assert!(!registry.record_handshake("ghost"));
        assert!(!registry.handshake_seen("ghost"));
        assert_eq!(registry.handshake_count(), 0);

        registry.insert(machine("vm-1"));
        assert!(registry.record_handshake("vm-1"));
        assert!(registry.handshake_seen("vm-1"));
        assert_eq!(registry.handshake_count(), 1);
    }

    #[test]
    fn handshake_flips_state_to_warm() {
        let registry = MachineRegistry::new();
        let m = machine("vm-1");
        registry.insert(m.clone());
        registry.record_handshake("vm-1");
        assert_eq!(m.state(), MachineState::Warm);
    }

    #[test]
    fn handshake_table_survives_machine_removal() {
        let registry = MachineRegistry::new();
        registry.insert(machine("vm-1"));
        registry.record_handshake("vm-1");
        registry.remove("vm-1");
        assert!(registry.handshake_seen("vm-1"));
        assert_eq!(registry.handshake_count(), 1);
    }

    #[test]
    fn first_handshake_timestamp_is_kept() {
        let registry = MachineRegistry::new();
        let m = machine("vm-1");
        registry.insert(m);
        registry.record_handshake("vm-1");
        let first = *registry
            .handshakes
            .read()
            .unwrap()
            .get("vm-1")
            .unwrap();
        registry.record_handshake("vm-1");
        let second = *registry
            .handshakes
            .read()
            .unwrap()
            .get("vm-1")
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn deployment_binding() {
        let m = machine("vm-1");
        m.bind_deployment(crate::machine::testutil::deploy_request(&["t.a"]), "tenant-a");
        assert_eq!(m.state(), MachineState::Deploying);
        assert_eq!(m.namespace().as_deref(), Some("tenant-a"));
        let deployment = m.deployment().unwrap();
        assert_eq!(deployment.request.workload_name, "echofn");
    }
}
