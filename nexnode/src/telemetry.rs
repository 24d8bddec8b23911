//! Node telemetry: Prometheus metric families plus the W3C trace-context
//! carrier used to propagate spans across the bus boundary.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::bus::Headers;
use crate::machine::MachineRegistry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WorkloadLabels {
    workload_type: String,
    namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespaceLabels {
    namespace: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TriggerLabels {
    namespace: String,
    workload_name: String,
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Node metric families. Deployment adds, teardown subtracts the amounts
/// recorded at deploy time, so every deploy/stop pair nets to zero.
///
/// Cheap to clone; all state lives behind an `Arc`.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    registry: Mutex<Registry>,
    machines: Gauge,
    workloads: Family<WorkloadLabels, Gauge>,
    deployed_bytes: Family<NamespaceLabels, Gauge>,
    allocated_vcpus: Family<NamespaceLabels, Gauge>,
    allocated_memory_mib: Family<NamespaceLabels, Gauge>,
    trigger_successes: Family<TriggerLabels, Counter>,
    trigger_failures: Family<TriggerLabels, Counter>,
    trigger_runtime_seconds: Family<TriggerLabels, Histogram>,
    start_time: Instant,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let machines = Gauge::default();
        registry.register(
            "nex_machines",
            "Machines currently bound to a deployed workload",
            machines.clone(),
        );

        let workloads = Family::<WorkloadLabels, Gauge>::default();
        registry.register(
            "nex_workloads",
            "Deployed workloads by type and namespace",
            workloads.clone(),
        );

        let deployed_bytes = Family::<NamespaceLabels, Gauge>::default();
        registry.register(
            "nex_deployed_bytes",
            "Total bytes of deployed workload artifacts",
            deployed_bytes.clone(),
        );

        let allocated_vcpus = Family::<NamespaceLabels, Gauge>::default();
        registry.register(
            "nex_allocated_vcpus",
            "vCPUs allocated to deployed workloads",
            allocated_vcpus.clone(),
        );

        let allocated_memory_mib = Family::<NamespaceLabels, Gauge>::default();
        registry.register(
            "nex_allocated_memory_mib",
            "Memory in MiB allocated to deployed workloads",
            allocated_memory_mib.clone(),
        );

        let trigger_successes = Family::<TriggerLabels, Counter>::default();
        registry.register(
            "nex_function_triggers",
            "Successful workload trigger invocations",
            trigger_successes.clone(),
        );

        let trigger_failures = Family::<TriggerLabels, Counter>::default();
        registry.register(
            "nex_function_failed_triggers",
            "Failed workload trigger invocations",
            trigger_failures.clone(),
        );

        // Runtimes span microseconds (tiny v8 functions) to many seconds.
        let trigger_runtime_seconds = Family::<TriggerLabels, Histogram>::new_with_constructor(
            || Histogram::new(exponential_buckets(0.000_001, 10.0, 9)),
        );
        registry.register(
            "nex_function_runtime_seconds",
            "Reported workload run time per trigger invocation",
            trigger_runtime_seconds.clone(),
        );

        Self {
            inner: Arc::new(TelemetryInner {
                registry: Mutex::new(registry),
                machines,
                workloads,
                deployed_bytes,
                allocated_vcpus,
                allocated_memory_mib,
                trigger_successes,
                trigger_failures,
                trigger_runtime_seconds,
                start_time: Instant::now(),
            }),
        }
    }

    /// Record a workload entering the Deployed state.
    pub fn workload_deployed(
        &self,
        workload_type: &str,
        namespace: &str,
        bytes: u64,
        vcpus: u64,
        memory_mib: u64,
    ) {
        let ns = NamespaceLabels {
            namespace: namespace.to_string(),
        };
        self.inner.machines.inc();
        self.inner
            .workloads
            .get_or_create(&WorkloadLabels {
                workload_type: workload_type.to_string(),
                namespace: namespace.to_string(),
            })
            .inc();
        self.inner.deployed_bytes.get_or_create(&ns).inc_by(bytes as i64);
        self.inner.allocated_vcpus.get_or_create(&ns).inc_by(vcpus as i64);
        self.inner
            .allocated_memory_mib
            .get_or_create(&ns)
            .inc_by(memory_mib as i64);
    }

    /// Inverse of [`Telemetry::workload_deployed`], with the amounts stored
    /// at deploy time.
    pub fn workload_stopped(
        &self,
        workload_type: &str,
        namespace: &str,
        bytes: u64,
        vcpus: u64,
        memory_mib: u64,
    ) {
        let ns = NamespaceLabels {
            namespace: namespace.to_string(),
        };
        self.inner.machines.dec();
        self.inner
            .workloads
            .get_or_create(&WorkloadLabels {
                workload_type: workload_type.to_string(),
                namespace: namespace.to_string(),
            })
            .dec();
        self.inner.deployed_bytes.get_or_create(&ns).dec_by(bytes as i64);
        self.inner.allocated_vcpus.get_or_create(&ns).dec_by(vcpus as i64);
        self.inner
            .allocated_memory_mib
            .get_or_create(&ns)
            .dec_by(memory_mib as i64);
    }

    pub fn trigger_succeeded(&self, namespace: &str, workload_name: &str, runtime_ns: u64) {
        let labels = TriggerLabels {
            namespace: namespace.to_string(),
            workload_name: workload_name.to_string(),
        };
        self.inner.trigger_successes.get_or_create(&labels).inc();
        self.inner
            .trigger_runtime_seconds
            .get_or_create(&labels)
            .observe(runtime_ns as f64 / 1e9);
    }

    pub fn trigger_failed(&self, namespace: &str, workload_name: &str) {
        self.inner
            .trigger_failures
            .get_or_create(&TriggerLabels {
                namespace: namespace.to_string(),
                workload_name: workload_name.to_string(),
            })
            .inc();
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self.inner.registry.lock().expect("metrics registry poisoned");
        encode(&mut buf, &registry).expect("metrics encoding cannot fail");
        buf
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Current value of the workload gauge for one (type, namespace) pair.
    #[allow(dead_code)] // public API exercised in tests, useful for monitoring
    pub fn workload_count(&self, workload_type: &str, namespace: &str) -> i64 {
        self.inner
            .workloads
            .get_or_create(&WorkloadLabels {
                workload_type: workload_type.to_string(),
                namespace: namespace.to_string(),
            })
            .get()
    }

    /// Current value of the machine gauge.
    #[allow(dead_code)] // public API exercised in tests, useful for monitoring
    pub fn machine_count(&self) -> i64 {
        self.inner.machines.get()
    }

    /// Current allocation gauges for one namespace: (bytes, vcpus, memory).
    #[allow(dead_code)] // public API exercised in tests, useful for monitoring
    pub fn allocations(&self, namespace: &str) -> (i64, i64, i64) {
        let ns = NamespaceLabels {
            namespace: namespace.to_string(),
        };
        (
            self.inner.deployed_bytes.get_or_create(&ns).get(),
            self.inner.allocated_vcpus.get_or_create(&ns).get(),
            self.inner.allocated_memory_mib.get_or_create(&ns).get(),
        )
    }
}

// ---------------------------------------------------------------------------
// HTTP exporter (axum)
// ---------------------------------------------------------------------------

struct ExporterState {
    telemetry: Telemetry,
    machines: Arc<MachineRegistry>,
}

async fn metrics_handler(State(state): State<Arc<ExporterState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.telemetry.encode_metrics(),
    )
}

async fn healthz_handler(State(state): State<Arc<ExporterState>>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "machines": state.machines.len(),
        "uptime_seconds": state.telemetry.uptime_seconds(),
    });
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
}

/// Serve `/metrics` and `/healthz` on a background task.
pub fn start_exporter(
    addr: SocketAddr,
    telemetry: Telemetry,
    machines: Arc<MachineRegistry>,
) -> tokio::task::JoinHandle<()> {
    let state = Arc::new(ExporterState { telemetry, machines });
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "failed to bind telemetry exporter");
                return;
            }
        };
        tracing::info!(%addr, "telemetry exporter listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "telemetry exporter error");
        }
    })
}

// ---------------------------------------------------------------------------
// W3C trace context carrier
// ---------------------------------------------------------------------------

pub const TRACEPARENT_HEADER: &str = "traceparent";

/// A W3C `traceparent` value carried in message headers so traces continue
/// across the bus boundary into the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lower-case hex digits, not all zero.
    pub trace_id: String,
    /// 16 lower-case hex digits, not all zero.
    pub span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    /// Fresh context for a new root span.
    pub fn generate() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
            sampled: true,
        }
    }

    /// Derive the context for a child span: same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().simple().to_string()[..16].to_string(),
            sampled: self.sampled,
        }
    }

    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{}",
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        // Only version 00 is emitted or accepted, and it has exactly four fields.
        if version != "00" || parts.next().is_some() {
            return None;
        }
        if !is_hex(trace_id, 32) || trace_id.bytes().all(|b| b == b'0') {
            return None;
        }
        if !is_hex(span_id, 16) || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        if !is_hex(flags, 2) {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
        })
    }

    pub fn inject(&self, headers: &mut Headers) {
        headers.insert(TRACEPARENT_HEADER, self.traceparent());
    }

    pub fn extract(headers: &Headers) -> Option<Self> {
        Self::parse(headers.get(TRACEPARENT_HEADER)?)
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}
