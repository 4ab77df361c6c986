//! FORWARD adapter - requests passing through this node
//!
//! Consumes the decision engine's verdict: forwards toward the next
//! hop, answers the origin with the synthesized rejection, or drops
//! silently. Calls that went through leave a relay entry so their
//! response finds the way back; the matching response path lives here
//! too.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapters::transport::NodeTransport;
use crate::routing::decision::Rejection;
use crate::routing::engine::ForwardingEngine;
use crate::session::routes::RelayTable;
use crate::shared::errors::SendError;
use crate::wire::envelope::{ErrorEnvelope, RequestEnvelope, ResponseEnvelope};
use crate::wire::ids::NodeId;
use crate::wire::result::ResultCode;

/// What became of a relayed request.
#[derive(Debug)]
pub enum RelayOutcome {
    Forwarded { next_hop: NodeId },
    Rejected,
    Dropped,
    Failed(SendError),
}

pub struct ForwardAdapter {
    node_id: NodeId,
    engine: Arc<ForwardingEngine>,
    transport: Arc<NodeTransport>,
    relays: Arc<RelayTable>,
}

impl ForwardAdapter {
    pub fn new(
        node_id: NodeId,
        engine: Arc<ForwardingEngine>,
        transport: Arc<NodeTransport>,
        relays: Arc<RelayTable>,
    ) -> Self {
        Self { node_id, engine, transport, relays }
    }

    /// Relay one request that is not addressed to this node.
    pub async fn relay_request(&self, origin: &NodeId, envelope: RequestEnvelope) -> RelayOutcome {
        let answerable = envelope.kind.expects_response();

        // A frame whose path already contains this node is circling.
        if envelope.path.contains(&self.node_id) {
            warn!(action = %envelope.action, request_id = %envelope.request_id,
                path = %envelope.path, "routing loop detected, rejecting");
            metrics::counter!("ocpp_messages_rejected_total", "action" => envelope.action.clone())
                .increment(1);
            if answerable {
                let error = ErrorEnvelope::new(
                    envelope.request_id.clone(),
                    ResultCode::GenericError,
                    format!("routing loop: {} already on path", self.node_id),
                )
                .answering(&envelope);
                self.answer_error(origin, &error);
            }
            return RelayOutcome::Rejected;
        }

        let mut decision = self.engine.decide(origin, &envelope).await;

        if decision.is_forward() {
            let mut outgoing = envelope.clone();
            if decision.is_rewritten() {
                if let Some(payload) = decision.new_payload.take() {
                    outgoing.payload = payload;
                }
                outgoing.signatures = std::mem::take(&mut decision.new_signatures);
            }

            // Back-route first. A response racing the relay entry
            // would otherwise have nowhere to go.
            if answerable {
                if let Err(collision) = self.relays.remember(
                    outgoing.request_id.clone(),
                    origin.clone(),
                    outgoing.action.clone(),
                ) {
                    warn!(origin = %origin, "{collision}, rejecting");
                    decision.notify_sent(None);
                    let error = ErrorEnvelope::new(
                        outgoing.request_id.clone(),
                        ResultCode::GenericError,
                        collision.to_string(),
                    )
                    .answering(&outgoing);
                    self.answer_error(origin, &error);
                    return RelayOutcome::Rejected;
                }
            }

            return match self.transport.send_request(&outgoing) {
                Ok(next_hop) => {
                    decision.notify_sent(Some(&next_hop));
                    RelayOutcome::Forwarded { next_hop }
                }
                Err(e) => {
                    decision.notify_sent(None);
                    self.relays.take(&outgoing.request_id);
                    warn!(action = %outgoing.action, request_id = %outgoing.request_id,
                        "relay send failed: {e}");
                    if answerable {
                        let error = ErrorEnvelope::new(
                            outgoing.request_id.clone(),
                            ResultCode::NetworkError,
                            e.to_string(),
                        )
                        .answering(&outgoing);
                        self.answer_error(origin, &error);
                    }
                    RelayOutcome::Failed(e)
                }
            };
        }

        if decision.is_drop() {
            debug!(action = %envelope.action, request_id = %envelope.request_id,
                reason = decision.reason.as_deref().unwrap_or("-"), "request dropped");
            return RelayOutcome::Dropped;
        }

        // Rejection. Sends are never answered, so for them this
        // degrades to a logged drop.
        if answerable {
            match decision.rejection.take() {
                Some(Rejection::Response(payload)) => {
                    let response = ResponseEnvelope::to(&envelope, payload)
                        .with_result(decision.result.clone());
                    if let Err(e) = self.transport.send_response(origin, &response) {
                        warn!(origin = %origin, "could not deliver rejection: {e}");
                    }
                }
                Some(Rejection::Error(error)) => {
                    self.answer_error(origin, &error.answering(&envelope));
                }
                None => {
                    let error = ErrorEnvelope::filtered(
                        envelope.request_id.clone(),
                        decision
                            .reason
                            .clone()
                            .unwrap_or_else(|| "request rejected".into()),
                    )
                    .answering(&envelope);
                    self.answer_error(origin, &error);
                }
            }
        }
        RelayOutcome::Rejected
    }

    /// Route a response back along the relay entry for its request id,
    /// or by its explicit destination when one is present. Gives the
    /// envelope back when neither applies.
    pub fn relay_response(
        &self,
        envelope: ResponseEnvelope,
    ) -> Result<NodeId, ResponseEnvelope> {
        if let Some(entry) = self.relays.take(&envelope.request_id) {
            let mut envelope = envelope;
            if envelope.action.is_empty() {
                envelope.action = entry.action.clone();
            }
            if let Err(e) = self.transport.send_response(&entry.origin, &envelope) {
                warn!(request_id = %envelope.request_id, origin = %entry.origin,
                    "response back-relay failed: {e}");
            }
            return Ok(entry.origin);
        }

        // Overlay responses can carry their own routing.
        if let Some(destination) = envelope.destination.clone() {
            if let Ok(next_hop) = self.transport.resolve_next_hop(&destination) {
                if self.transport.send_response(&next_hop, &envelope).is_ok() {
                    return Ok(next_hop);
                }
            }
        }
        Err(envelope)
    }

    /// Same back-routing for CallErrors.
    pub fn relay_error(&self, envelope: ErrorEnvelope) -> Result<NodeId, ErrorEnvelope> {
        if let Some(entry) = self.relays.take(&envelope.request_id) {
            if let Err(e) = self.transport.send_error(&entry.origin, &envelope) {
                warn!(request_id = %envelope.request_id, origin = %entry.origin,
                    "error back-relay failed: {e}");
            }
            return Ok(entry.origin);
        }

        if let Some(destination) = envelope.destination.clone() {
            if let Ok(next_hop) = self.transport.resolve_next_hop(&destination) {
                if self.transport.send_error(&next_hop, &envelope).is_ok() {
                    return Ok(next_hop);
                }
            }
        }
        Err(envelope)
    }

    fn answer_error(&self, origin: &NodeId, error: &ErrorEnvelope) {
        if let Err(e) = self.transport.send_error(origin, error) {
            warn!(origin = %origin, "could not deliver error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::EventBus;
    use crate::events::Event;
    use crate::routing::codec::{OcppRequest, OcppResponse};
    use crate::routing::filter::FilterDecision;
    use crate::routing::registry::MessageRegistry;
    use crate::session::connection::{LinkMessage, PeerRole};
    use crate::session::registry::PeerRegistry;
    use crate::session::routes::RouteTable;
    use crate::wire::envelope::Payload;
    use crate::wire::frame::{Frame, NetworkingMode};
    use crate::wire::path::{Destination, NetworkPath};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct MeterRequest {
        reading: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct MeterResponse {
        status: String,
    }

    impl OcppRequest for MeterRequest {
        const ACTION: &'static str = "MeterValues";
        type Response = MeterResponse;

        fn rejected_response(&self, _reason: &str) -> Option<MeterResponse> {
            Some(MeterResponse { status: "Rejected".into() })
        }
    }
    impl OcppResponse for MeterResponse {}

    struct Bench {
        adapter: ForwardAdapter,
        registry: Arc<MessageRegistry>,
        relays: Arc<RelayTable>,
        peers: Arc<PeerRegistry>,
        events: EventBus,
    }

    fn bench() -> Bench {
        let node_id = NodeId::new("NN-1");
        let peers = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let relays = Arc::new(RelayTable::new());
        let registry = Arc::new(MessageRegistry::new());
        registry.register::<MeterRequest>();
        let events = EventBus::new();
        let engine = Arc::new(ForwardingEngine::new(
            node_id.clone(),
            registry.clone(),
            events.clone(),
        ));
        let transport = Arc::new(NodeTransport::new(node_id.clone(), peers.clone(), routes));
        let adapter = ForwardAdapter::new(node_id, engine, transport, relays.clone());
        Bench { adapter, registry, relays, peers, events }
    }

    fn attach(bench: &Bench, id: &str, role: PeerRole) -> mpsc::UnboundedReceiver<LinkMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        bench
            .peers
            .register(NodeId::new(id), role, NetworkingMode::OverlayNetwork, tx);
        rx
    }

    fn upward_call(payload: serde_json::Value) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::call(
            "MeterValues",
            Payload::Json(payload),
            Destination::Node(NodeId::csms()),
        );
        envelope.path = NetworkPath::from(vec![NodeId::new("CS-1")]);
        envelope
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<LinkMessage>) -> String {
        let LinkMessage::Text(text) = rx.recv().await.unwrap();
        text
    }

    #[tokio::test]
    async fn forwarded_call_leaves_a_relay_entry() {
        let bench = bench();
        let mut upstream = attach(&bench, "CSMS", PeerRole::Csms);

        let envelope = upward_call(json!({"reading": 42}));
        let request_id = envelope.request_id.clone();
        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), envelope)
            .await;

        assert!(matches!(outcome, RelayOutcome::Forwarded { next_hop } if next_hop == NodeId::csms()));
        assert_eq!(bench.relays.len(), 1);

        let text = next_text(&mut upstream).await;
        match Frame::parse(&text).unwrap() {
            Frame::Request(sent) => {
                assert_eq!(sent.request_id, request_id);
                assert_eq!(sent.path.hops(), &[NodeId::new("CS-1"), NodeId::new("NN-1")]);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_call_answers_origin_with_typed_status() {
        let bench = bench();
        let _upstream = attach(&bench, "CSMS", PeerRole::Csms);
        let mut origin = attach(&bench, "CS-1", PeerRole::ChargingStation);

        bench.registry.filter::<MeterRequest, _, _>(|_ctx, _req| async move {
            FilterDecision::reject("reading too far in the past")
        });

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), upward_call(json!({"reading": 42})))
            .await;
        assert!(matches!(outcome, RelayOutcome::Rejected));

        let text = next_text(&mut origin).await;
        match Frame::parse(&text).unwrap() {
            Frame::Response(response) => {
                assert_eq!(response.payload.as_json().unwrap()["status"], "Rejected");
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(bench.relays.is_empty());
    }

    #[tokio::test]
    async fn dropped_call_answers_nobody() {
        let bench = bench();
        let _upstream = attach(&bench, "CSMS", PeerRole::Csms);
        let mut origin = attach(&bench, "CS-1", PeerRole::ChargingStation);

        bench.registry.filter::<MeterRequest, _, _>(|_ctx, _req| async move {
            FilterDecision::dropped("noise")
        });

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), upward_call(json!({"reading": 42})))
            .await;
        assert!(matches!(outcome, RelayOutcome::Dropped));
        assert!(origin.try_recv().is_err());
        assert!(bench.relays.is_empty());
    }

    #[tokio::test]
    async fn rewrite_forwards_new_bytes() {
        let bench = bench();
        let mut upstream = attach(&bench, "CSMS", PeerRole::Csms);

        bench.registry.filter::<MeterRequest, _, _>(|_ctx, _req| async move {
            FilterDecision::Replace(MeterRequest { reading: 7 })
        });

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), upward_call(json!({"reading": 42})))
            .await;
        assert!(matches!(outcome, RelayOutcome::Forwarded { .. }));

        let text = next_text(&mut upstream).await;
        match Frame::parse(&text).unwrap() {
            Frame::Request(sent) => {
                assert_eq!(sent.payload.as_json().unwrap()["reading"], 7);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwarded_event_names_the_chosen_hop() {
        let bench = bench();
        let mut relay = attach(&bench, "NN-2", PeerRole::LocalController);
        let mut subscriber = bench.events.subscribe();

        // Pinned route: NN-2 carries the frame, CS-9 is where it ends.
        let mut envelope = RequestEnvelope::call(
            "MeterValues",
            Payload::Json(json!({"reading": 42})),
            Destination::Route(vec![NodeId::new("NN-2"), NodeId::new("CS-9")]),
        );
        envelope.path = NetworkPath::from(vec![NodeId::new("CS-1")]);

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), envelope)
            .await;
        assert!(
            matches!(outcome, RelayOutcome::Forwarded { next_hop } if next_hop == NodeId::new("NN-2"))
        );
        let _ = next_text(&mut relay).await;

        // The event reports the hop the frame went to, not the end of
        // the route.
        loop {
            let message = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                subscriber.recv(),
            )
            .await
            .expect("forwarded event missing")
            .unwrap();
            if let Event::RequestForwarded(forwarded) = message.event {
                assert!(forwarded.success);
                assert_eq!(forwarded.next_hop.as_deref(), Some("NN-2"));
                break;
            }
        }
    }

    #[tokio::test]
    async fn looping_request_is_rejected() {
        let bench = bench();
        let _upstream = attach(&bench, "CSMS", PeerRole::Csms);
        let mut origin = attach(&bench, "NN-2", PeerRole::LocalController);

        let mut envelope = upward_call(json!({"reading": 42}));
        envelope.path = NetworkPath::from(vec![
            NodeId::new("CS-1"),
            NodeId::new("NN-1"),
            NodeId::new("NN-2"),
        ]);

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("NN-2"), envelope)
            .await;
        assert!(matches!(outcome, RelayOutcome::Rejected));

        let text = next_text(&mut origin).await;
        match Frame::parse(&text).unwrap() {
            Frame::Error(error) => {
                assert_eq!(error.code, ResultCode::GenericError);
                assert!(error.description.contains("routing loop"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_next_hop_fails_back_to_origin() {
        let bench = bench();
        let mut origin = attach(&bench, "CS-1", PeerRole::ChargingStation);
        // no upstream registered at all

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), upward_call(json!({"reading": 42})))
            .await;
        assert!(matches!(outcome, RelayOutcome::Failed(SendError::NoRoute(_))));
        assert!(bench.relays.is_empty());

        let text = next_text(&mut origin).await;
        match Frame::parse(&text).unwrap() {
            Frame::Error(error) => assert_eq!(error.code, ResultCode::NetworkError),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_request_id_collides() {
        let bench = bench();
        let _upstream = attach(&bench, "CSMS", PeerRole::Csms);
        let mut origin = attach(&bench, "CS-1", PeerRole::ChargingStation);

        let envelope = upward_call(json!({"reading": 1}));
        bench
            .relays
            .remember(envelope.request_id.clone(), NodeId::new("CS-9"), "MeterValues")
            .unwrap();

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), envelope)
            .await;
        assert!(matches!(outcome, RelayOutcome::Rejected));

        let text = next_text(&mut origin).await;
        assert!(matches!(Frame::parse(&text).unwrap(), Frame::Error(_)));
    }

    #[tokio::test]
    async fn response_follows_the_relay_entry_back() {
        let bench = bench();
        let mut origin = attach(&bench, "CS-1", PeerRole::ChargingStation);

        let envelope = upward_call(json!({"reading": 1}));
        bench
            .relays
            .remember(envelope.request_id.clone(), NodeId::new("CS-1"), "MeterValues")
            .unwrap();

        let response = ResponseEnvelope::to(&envelope, Payload::Json(json!({"status": "Accepted"})));
        let back = bench.adapter.relay_response(response).unwrap();
        assert_eq!(back, NodeId::new("CS-1"));
        assert!(bench.relays.is_empty());

        let text = next_text(&mut origin).await;
        assert!(matches!(Frame::parse(&text).unwrap(), Frame::Response(_)));
    }

    #[tokio::test]
    async fn second_response_to_same_id_finds_no_route() {
        let bench = bench();
        let _origin = attach(&bench, "CS-1", PeerRole::ChargingStation);

        let envelope = upward_call(json!({"reading": 1}));
        bench
            .relays
            .remember(envelope.request_id.clone(), NodeId::new("CS-1"), "MeterValues")
            .unwrap();

        let first = ResponseEnvelope::to(&envelope, Payload::Json(json!({"status": "Accepted"})));
        let second = first.clone();
        assert!(bench.adapter.relay_response(first).is_ok());
        assert!(bench.adapter.relay_response(second).is_err());
    }

    #[tokio::test]
    async fn fire_and_forget_relays_without_relay_entry() {
        let bench = bench();
        let mut upstream = attach(&bench, "CSMS", PeerRole::Csms);

        let mut envelope = RequestEnvelope::send(
            "MeterValues",
            Payload::Json(json!({"reading": 42})),
            Destination::Node(NodeId::csms()),
        );
        envelope.path = NetworkPath::from(vec![NodeId::new("CS-1")]);

        let outcome = bench
            .adapter
            .relay_request(&NodeId::new("CS-1"), envelope)
            .await;
        assert!(matches!(outcome, RelayOutcome::Forwarded { .. }));
        assert!(bench.relays.is_empty());

        let text = next_text(&mut upstream).await;
        match Frame::parse(&text).unwrap() {
            Frame::Request(sent) => assert!(!sent.kind.expects_response()),
            other => panic!("expected request, got {other:?}"),
        }
    }
}
