//! OUT adapter - requests this node originates
//!
//! Statically typed: callers hand over an `OcppRequest` value and get
//! back a [`CallResponse`] carrying the typed response, or the result
//! that explains its absence. Registration with the correlation
//! tracker happens before the frame leaves, so a fast answer can never
//! slip past its waiter. This path never hangs and never returns
//! nothing: timeout, cancellation and transport failure all surface as
//! result codes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::adapters::transport::NodeTransport;
use crate::correlation::{RequestTracker, WaitOutcome};
use crate::events::bus::EventBus;
use crate::events::kinds::{Event, RequestSendingEvent, ResponseReceivedEvent};
use crate::routing::codec::OcppRequest;
use crate::shared::errors::SendError;
use crate::wire::envelope::{Payload, RequestEnvelope};
use crate::wire::ids::RequestId;
use crate::wire::path::Destination;
use crate::wire::result::{ResultCode, RpcResult};
use crate::wire::signature::{SignatureKeyring, VerifyMode};

/// The one thing `call` ever returns.
///
/// `response` is present exactly when `result` is `Ok`.
#[derive(Debug)]
pub struct CallResponse<R> {
    pub request_id: RequestId,
    pub result: RpcResult,
    pub response: Option<R>,
    pub runtime: Duration,
}

impl<R> CallResponse<R> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    fn failed(request_id: RequestId, result: RpcResult, runtime: Duration) -> Self {
        Self { request_id, result, response: None, runtime }
    }
}

pub struct OutboundAdapter {
    tracker: Arc<RequestTracker>,
    transport: Arc<NodeTransport>,
    events: EventBus,
    keyring: Arc<SignatureKeyring>,
    verify_mode: VerifyMode,
    /// When set, outgoing JSON payloads are signed with this key.
    sign_key: Option<String>,
}

impl OutboundAdapter {
    pub fn new(
        tracker: Arc<RequestTracker>,
        transport: Arc<NodeTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            tracker,
            transport,
            events,
            keyring: Arc::new(SignatureKeyring::new()),
            verify_mode: VerifyMode::Off,
            sign_key: None,
        }
    }

    pub fn with_signature_policy(
        mut self,
        keyring: Arc<SignatureKeyring>,
        verify_mode: VerifyMode,
        sign_key: Option<String>,
    ) -> Self {
        self.keyring = keyring;
        self.verify_mode = verify_mode;
        self.sign_key = sign_key;
        self
    }

    /// Issue a Call and wait for its answer.
    pub async fn call<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
    ) -> CallResponse<M::Response> {
        self.call_with_timeout(destination, request, None).await
    }

    /// Issue a Call with an explicit per-request timeout.
    pub async fn call_with_timeout<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
        timeout: Option<Duration>,
    ) -> CallResponse<M::Response> {
        let started = Instant::now();

        let payload = match serde_json::to_value(request) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                // Only reachable with a broken Serialize impl.
                return CallResponse::failed(
                    RequestId::generate(),
                    RpcResult::error(ResultCode::InternalError, e.to_string()),
                    started.elapsed(),
                );
            }
        };

        let mut envelope = RequestEnvelope::call(M::ACTION, payload, destination);
        if let Some(timeout) = timeout {
            envelope = envelope.with_timeout(timeout);
        }
        self.sign(&mut envelope);
        let request_id = envelope.request_id.clone();

        self.events.publish(Event::RequestSending(RequestSendingEvent {
            action: M::ACTION.to_string(),
            request_id: request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            destination: envelope
                .destination
                .final_node()
                .map(|n| n.to_string())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }));

        // Register before the frame can leave.
        let pending = match self.tracker.register(&envelope) {
            Ok(pending) => pending,
            Err(e) => {
                return CallResponse::failed(
                    request_id,
                    RpcResult::error(ResultCode::InternalError, e.to_string()),
                    started.elapsed(),
                );
            }
        };

        if let Err(e) = self.transport.send_request(&envelope) {
            self.tracker.abandon(&request_id);
            warn!(action = M::ACTION, request_id = %request_id, "send failed: {e}");
            return self.finish::<M>(envelope, RpcResult::from(&e), None, started);
        }

        let outcome = self
            .tracker
            .wait(pending, envelope.timeout, &envelope.cancel)
            .await;

        match outcome {
            WaitOutcome::Response(response) => {
                if let Some(value) = response.payload.as_json() {
                    if let Err(fault) = self.keyring.verify(
                        M::ACTION,
                        &request_id,
                        value,
                        &response.signatures,
                        self.verify_mode,
                    ) {
                        warn!(action = M::ACTION, request_id = %request_id,
                            "response signature check failed: {fault}");
                        return self.finish::<M>(
                            envelope,
                            RpcResult::error(ResultCode::SignatureError, fault.to_string()),
                            None,
                            started,
                        );
                    }
                }
                match Self::parse_response::<M>(&response.payload) {
                    Ok(typed) => self.finish::<M>(envelope, RpcResult::ok(), Some(typed), started),
                    Err(detail) => self.finish::<M>(
                        envelope,
                        RpcResult::error(ResultCode::FormationViolation, detail),
                        None,
                        started,
                    ),
                }
            }
            WaitOutcome::Error(error) => {
                debug!(action = M::ACTION, request_id = %request_id,
                    code = %error.code, "call answered with error");
                self.finish::<M>(envelope, error.to_result(), None, started)
            }
            WaitOutcome::TimedOut => {
                let result = RpcResult::timed_out(M::ACTION, envelope.timeout.as_secs());
                self.finish::<M>(envelope, result, None, started)
            }
            WaitOutcome::Cancelled => self.finish::<M>(
                envelope,
                RpcResult::error(ResultCode::GenericError, "request cancelled"),
                None,
                started,
            ),
        }
    }

    /// Issue a fire-and-forget Send. No correlation entry is created
    /// and no answer will ever arrive.
    pub fn send<M: OcppRequest>(
        &self,
        destination: Destination,
        request: &M,
    ) -> Result<(), SendError> {
        let value = serde_json::to_value(request)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
        let mut envelope = RequestEnvelope::send(M::ACTION, Payload::Json(value), destination);
        self.sign(&mut envelope);

        self.events.publish(Event::RequestSending(RequestSendingEvent {
            action: M::ACTION.to_string(),
            request_id: envelope.request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            destination: envelope
                .destination
                .final_node()
                .map(|n| n.to_string())
                .unwrap_or_default(),
            timestamp: Utc::now(),
        }));

        self.transport.send_request(&envelope).map(|_| ())
    }

    fn parse_response<M: OcppRequest>(payload: &Payload) -> Result<M::Response, String> {
        let value = payload
            .as_json()
            .ok_or_else(|| format!("{} response payload is not JSON", M::ACTION))?;
        serde_json::from_value(value.clone())
            .map_err(|e| format!("malformed {} response: {e}", M::ACTION))
    }

    fn finish<M: OcppRequest>(
        &self,
        envelope: RequestEnvelope,
        result: RpcResult,
        response: Option<M::Response>,
        started: Instant,
    ) -> CallResponse<M::Response> {
        let runtime = started.elapsed();
        self.events.publish(Event::ResponseReceived(ResponseReceivedEvent {
            action: envelope.action.clone(),
            request_id: envelope.request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            result: result.code.to_string(),
            runtime_ms: runtime.as_millis() as u64,
            timestamp: Utc::now(),
        }));
        CallResponse {
            request_id: envelope.request_id,
            result,
            response,
            runtime,
        }
    }

    fn sign(&self, envelope: &mut RequestEnvelope) {
        let Some(key_id) = self.sign_key.as_deref() else {
            return;
        };
        let Some(value) = envelope.payload.as_json() else {
            return;
        };
        match self
            .keyring
            .sign(&envelope.action, &envelope.request_id, value, key_id)
        {
            Ok(signature) => envelope.signatures.push(signature),
            Err(fault) => {
                warn!(action = %envelope.action, "request signing failed: {fault}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::codec::OcppResponse;
    use crate::session::connection::{LinkMessage, PeerRole};
    use crate::session::registry::PeerRegistry;
    use crate::session::routes::RouteTable;
    use crate::wire::envelope::{ErrorEnvelope, ResponseEnvelope};
    use crate::wire::frame::{Frame, NetworkingMode};
    use crate::wire::ids::NodeId;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StatusRequest {
        station: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct StatusResponse {
        status: String,
    }

    impl OcppRequest for StatusRequest {
        const ACTION: &'static str = "NodeStatus";
        type Response = StatusResponse;
    }
    impl OcppResponse for StatusResponse {}

    struct Bench {
        adapter: OutboundAdapter,
        tracker: Arc<RequestTracker>,
        upstream_rx: mpsc::UnboundedReceiver<LinkMessage>,
    }

    fn bench() -> Bench {
        let peers = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let (tx, upstream_rx) = mpsc::unbounded_channel();
        peers.register(
            NodeId::csms(),
            PeerRole::Csms,
            NetworkingMode::OverlayNetwork,
            tx,
        );
        let tracker = Arc::new(RequestTracker::new());
        let transport = Arc::new(NodeTransport::new(NodeId::new("NN-1"), peers, routes));
        let adapter = OutboundAdapter::new(tracker.clone(), transport, EventBus::new());
        Bench { adapter, tracker, upstream_rx }
    }

    async fn sent_request(rx: &mut mpsc::UnboundedReceiver<LinkMessage>) -> RequestEnvelope {
        let LinkMessage::Text(text) = rx.recv().await.unwrap();
        match Frame::parse(&text).unwrap() {
            Frame::Request(envelope) => envelope,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_resolves_with_typed_response() {
        let Bench { adapter, tracker, mut upstream_rx } = bench();

        let answer = tokio::spawn(async move {
            let sent = sent_request(&mut upstream_rx).await;
            let response = ResponseEnvelope::to(&sent, Payload::Json(json!({"status": "Up"})));
            tracker.resolve(response).unwrap();
        });

        let reply = adapter
            .call(
                Destination::Node(NodeId::csms()),
                &StatusRequest { station: "CS-1".into() },
            )
            .await;
        answer.await.unwrap();

        assert!(reply.is_ok());
        assert_eq!(reply.response.unwrap().status, "Up");
    }

    #[tokio::test]
    async fn malformed_response_payload_is_a_formation_violation() {
        let Bench { adapter, tracker, mut upstream_rx } = bench();

        let answer = tokio::spawn(async move {
            let sent = sent_request(&mut upstream_rx).await;
            let response = ResponseEnvelope::to(&sent, Payload::Json(json!({"status": 17})));
            tracker.resolve(response).unwrap();
        });

        let reply = adapter
            .call(
                Destination::Node(NodeId::csms()),
                &StatusRequest { station: "CS-1".into() },
            )
            .await;
        answer.await.unwrap();

        assert_eq!(reply.result.code, ResultCode::FormationViolation);
        assert!(reply.response.is_none());
    }

    #[tokio::test]
    async fn call_error_surfaces_as_result() {
        let Bench { adapter, tracker, mut upstream_rx } = bench();

        let answer = tokio::spawn(async move {
            let sent = sent_request(&mut upstream_rx).await;
            let error = ErrorEnvelope::new(
                sent.request_id.clone(),
                ResultCode::InternalError,
                "backend down",
            );
            tracker.fail(error).unwrap();
        });

        let reply = adapter
            .call(
                Destination::Node(NodeId::csms()),
                &StatusRequest { station: "CS-1".into() },
            )
            .await;
        answer.await.unwrap();

        assert_eq!(reply.result.code, ResultCode::InternalError);
        assert_eq!(reply.result.detail.as_deref(), Some("backend down"));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_as_generic_error() {
        let bench = bench();

        let reply = bench
            .adapter
            .call_with_timeout(
                Destination::Node(NodeId::csms()),
                &StatusRequest { station: "CS-1".into() },
                Some(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(reply.result.code, ResultCode::GenericError);
        assert!(reply.response.is_none());
        assert_eq!(bench.tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn unreachable_destination_is_a_network_error() {
        let peers = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let tracker = Arc::new(RequestTracker::new());
        let transport = Arc::new(NodeTransport::new(NodeId::new("NN-1"), peers, routes));
        let adapter = OutboundAdapter::new(tracker.clone(), transport, EventBus::new());

        let reply = adapter
            .call(
                Destination::Node(NodeId::new("CS-404")),
                &StatusRequest { station: "CS-404".into() },
            )
            .await;

        assert_eq!(reply.result.code, ResultCode::NetworkError);
        // nothing left pending after an immediate failure
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn send_goes_out_without_a_correlation_entry() {
        let mut bench = bench();

        bench
            .adapter
            .send(
                Destination::Node(NodeId::csms()),
                &StatusRequest { station: "CS-1".into() },
            )
            .unwrap();

        let sent = sent_request(&mut bench.upstream_rx).await;
        assert!(!sent.kind.expects_response());
        assert_eq!(bench.tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn outgoing_request_is_signed_when_configured() {
        let peers = Arc::new(PeerRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        peers.register(
            NodeId::csms(),
            PeerRole::Csms,
            NetworkingMode::OverlayNetwork,
            tx,
        );
        let tracker = Arc::new(RequestTracker::new());
        let transport = Arc::new(NodeTransport::new(NodeId::new("NN-1"), peers, routes));
        let mut keyring = SignatureKeyring::new();
        keyring.insert("k1", b"secret".to_vec());
        let adapter = OutboundAdapter::new(tracker.clone(), transport, EventBus::new())
            .with_signature_policy(Arc::new(keyring), VerifyMode::Off, Some("k1".into()));

        let call = tokio::spawn(async move {
            adapter
                .call_with_timeout(
                    Destination::Node(NodeId::csms()),
                    &StatusRequest { station: "CS-1".into() },
                    Some(Duration::from_millis(200)),
                )
                .await
        });

        let sent = sent_request(&mut rx).await;
        assert_eq!(sent.signatures.len(), 1);
        assert_eq!(sent.signatures[0].key_id, "k1");

        let response = ResponseEnvelope::to(&sent, Payload::Json(json!({"status": "Up"})));
        tracker.resolve(response).unwrap();
        assert!(call.await.unwrap().is_ok());
    }
}
