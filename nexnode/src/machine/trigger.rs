//! Per-(machine, subject) trigger routing.
//!
//! One router is installed per trigger subject when a workload deploys. Each
//! inbound message becomes a request to the agent; the agent's reply is
//! relayed back to the external requester. Routers never serialize across
//! messages; the agent is the single sequencer of workload execution.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, Instrument, Span};

use nex_agent_api::{trigger_subject, WorkloadKind, HEADER_RUNTIME_NS, HEADER_TRIGGER_SUBJECT};

use crate::bus::{Bus, BusError, Message, MessageHandler};
use crate::events::{EventPublisher, NodeEvent};
use crate::machine::NodeError;
use crate::telemetry::{Telemetry, TraceContext};

pub struct TriggerRouter {
    internal: Bus,
    events: EventPublisher,
    telemetry: Telemetry,
    machine_id: String,
    namespace: String,
    workload_name: String,
    workload_type: WorkloadKind,
    timeout: Duration,
}

impl TriggerRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        internal: Bus,
        events: EventPublisher,
        telemetry: Telemetry,
        machine_id: String,
        namespace: String,
        workload_name: String,
        workload_type: WorkloadKind,
        timeout: Duration,
    ) -> Self {
        Self {
            internal,
            events,
            telemetry,
            machine_id,
            namespace,
            workload_name,
            workload_type,
            timeout,
        }
    }

    async fn invoke(&self, msg: Message) {
        let mut request = Message::new(trigger_subject(&self.machine_id), msg.payload.clone());
        request
            .headers
            .insert(HEADER_TRIGGER_SUBJECT, msg.subject.clone());
        // Continue the trace the external publisher started, or open a new
        // one when the message arrived without a carrier.
        let context = TraceContext::extract(&msg.headers)
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::generate);
        context.inject(&mut request.headers);

        match self.internal.request_msg(request, self.timeout).await {
            Ok(reply) => {
                let runtime_ns = match reply.headers.get(HEADER_RUNTIME_NS).map(str::parse::<u64>)
                {
                    Some(Ok(ns)) => ns,
                    _ => {
                        debug!(
                            vmid = %self.machine_id,
                            trigger_subject = %msg.subject,
                            "agent reply carried no usable runtime header"
                        );
                        0
                    }
                };

                debug!(
                    vmid = %self.machine_id,
                    trigger_subject = %msg.subject,
                    workload_type = %self.workload_type,
                    runtime_ns,
                    payload_size = reply.payload.len(),
                    "workload trigger completed"
                );

                self.telemetry
                    .trigger_succeeded(&self.namespace, &self.workload_name, runtime_ns);
                self.events
                    .publish(
                        &self.namespace,
                        NodeEvent::FunctionExecSucceeded {
                            machine_id: self.machine_id.clone(),
                            workload_name: self.workload_name.clone(),
                            trigger_subject: msg.subject.clone(),
                            runtime_ns,
                        },
                    )
                    .await;

                if msg.respond(reply.payload) {
                    Span::current().record("otel.status_code", "OK");
                } else {
                    Span::current().record("otel.status_code", "ERROR");
                    error!(
                        vmid = %self.machine_id,
                        trigger_subject = %msg.subject,
                        "failed to respond to trigger request"
                    );
                }
            }
            Err(e) => {
                Span::current().record("otel.status_code", "ERROR");
                error!(
                    vmid = %self.machine_id,
                    trigger_subject = %msg.subject,
                    workload_type = %self.workload_type,
                    error = %e,
                    "failed to request workload execution via internal trigger subject"
                );

                let reason = match e {
                    BusError::Timeout(subject) => NodeError::TriggerTimeout(subject).to_string(),
                    other => other.to_string(),
                };
                self.telemetry
                    .trigger_failed(&self.namespace, &self.workload_name);
                self.events
                    .publish(
                        &self.namespace,
                        NodeEvent::FunctionExecFailed {
                            machine_id: self.machine_id.clone(),
                            workload_name: self.workload_name.clone(),
                            trigger_subject: msg.subject.clone(),
                            error: reason,
                        },
                    )
                    .await;
                // The external requester gets no reply; absence is the
                // failure signal.
            }
        }
    }
}

#[async_trait]
impl MessageHandler for TriggerRouter {
    async fn handle(&self, msg: Message) {
        let span = tracing::info_span!(
            parent: None,
            "workload-trigger",
            workload = %self.workload_name,
            namespace = %self.namespace,
            trigger_subject = %msg.subject,
            otel.kind = "server",
            otel.status_code = tracing::field::Empty,
        );
        self.invoke(msg).instrument(span).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEnvelope;
    use crate::machine::testutil::{collector, recv};
    use std::sync::Arc;

    struct EchoAgent {
        runtime_ns: u64,
    }

    #[async_trait]
    impl MessageHandler for EchoAgent {
        async fn handle(&self, msg: Message) {
            // The router must have tagged the message with its origin subject
            // and a trace context before it reaches the agent.
            assert_eq!(msg.headers.get(HEADER_TRIGGER_SUBJECT), Some("t.a"));
            assert!(TraceContext::extract(&msg.headers).is_some());

            let mut reply = Message::new("_reply", msg.payload.clone());
            reply
                .headers
                .insert(HEADER_RUNTIME_NS, self.runtime_ns.to_string());
            msg.respond_msg(reply);
        }
    }

    fn router(internal: &Bus, external: &Bus, telemetry: &Telemetry) -> Arc<TriggerRouter> {
        Arc::new(TriggerRouter::new(
            internal.clone(),
            EventPublisher::new(external.clone()),
            telemetry.clone(),
            "vm-1".to_string(),
            "tenant-a".to_string(),
            "echofn".to_string(),
            WorkloadKind::V8,
            Duration::from_millis(500),
        ))
    }

    #[tokio::test]
    async fn trigger_relays_agent_reply() {
        let internal = Bus::new();
        let external = Bus::new();
        let telemetry = Telemetry::new();

        let _agent = internal
            .subscribe("agentint.vm-1.trigger", Arc::new(EchoAgent { runtime_ns: 1500 }))
            .await
            .unwrap();
        let _route = external
            .subscribe("t.a", router(&internal, &external, &telemetry))
            .await
            .unwrap();
        let (events, mut events_rx) = collector();
        let _events = external.subscribe("$NEX.events.>", events).await.unwrap();

        let reply = external
            .request("t.a", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"ping");

        let event = recv(&mut events_rx).await;
        assert_eq!(event.subject, "$NEX.events.tenant-a.function_exec_succeeded");
        let envelope: EventEnvelope = serde_json::from_slice(&event.payload).unwrap();
        match envelope.event {
            NodeEvent::FunctionExecSucceeded { runtime_ns, .. } => assert_eq!(runtime_ns, 1500),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn trigger_without_agent_fails_silently_to_the_caller() {
        let internal = Bus::new();
        let external = Bus::new();
        let telemetry = Telemetry::new();

        let _route = external
            .subscribe("t.a", router(&internal, &external, &telemetry))
            .await
            .unwrap();
        let (events, mut events_rx) = collector();
        let _events = external.subscribe("$NEX.events.>", events).await.unwrap();

        // No agent subscription on the internal bus: the external requester
        // sees only a missing reply.
        let err = external
            .request("t.a", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoReply(_)));

        let event = recv(&mut events_rx).await;
        assert_eq!(event.subject, "$NEX.events.tenant-a.function_exec_failed");
    }

    #[tokio::test]
    async fn inbound_trace_context_is_continued() {
        use crate::telemetry::TRACEPARENT_HEADER;

        // Replies with the traceparent it received, so the test can inspect
        // what crossed the bus boundary.
        struct TraceEcho;
        #[async_trait]
        impl MessageHandler for TraceEcho {
            async fn handle(&self, msg: Message) {
                let carrier = msg
                    .headers
                    .get(TRACEPARENT_HEADER)
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec();
                msg.respond(carrier);
            }
        }

        let internal = Bus::new();
        let external = Bus::new();
        let telemetry = Telemetry::new();
        let _agent = internal
            .subscribe("agentint.vm-1.trigger", Arc::new(TraceEcho))
            .await
            .unwrap();
        let _route = external
            .subscribe("t.a", router(&internal, &external, &telemetry))
            .await
            .unwrap();

        let parent = TraceContext::generate();
        let mut msg = Message::new("t.a", Vec::new());
        parent.inject(&mut msg.headers);
        let reply = external
            .request_msg(msg, Duration::from_secs(1))
            .await
            .unwrap();

        let forwarded = TraceContext::parse(&String::from_utf8(reply.payload).unwrap()).unwrap();
        assert_eq!(forwarded.trace_id, parent.trace_id);
        assert_ne!(forwarded.span_id, parent.span_id);
    }

    #[tokio::test]
    async fn successful_triggers_are_counted() {
        let internal = Bus::new();
        let external = Bus::new();
        let telemetry = Telemetry::new();

        let _agent = internal
            .subscribe("agentint.vm-1.trigger", Arc::new(EchoAgent { runtime_ns: 10 }))
            .await
            .unwrap();
        let r = router(&internal, &external, &telemetry);

        // Success path, invoked directly.
        let (msg, _rx) = Message::new_request("t.a", b"x".to_vec());
        r.handle(msg).await;

        let text = telemetry.encode_metrics();
        assert!(text.contains("nex_function_triggers"));
        assert!(text.contains("echofn"));
    }
}
