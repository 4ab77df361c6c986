//! IN adapter - requests addressed to this node
//!
//! Parses the payload into its typed request, lets every registered
//! handler see it concurrently, and turns the first non-null answer
//! into the response envelope. A request that nobody answers still
//! gets the message type's Failed default, so a Call is never left
//! hanging; fire-and-forget Sends run their handlers and produce
//! nothing.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::events::bus::EventBus;
use crate::events::kinds::{Event, RequestReceivedEvent, ResponseSentEvent};
use crate::routing::registry::{MessageRegistry, RequestContext};
use crate::wire::envelope::{ErrorEnvelope, Payload, RequestEnvelope, RequestKind, ResponseEnvelope};
use crate::wire::ids::NodeId;
use crate::wire::result::{ResultCode, RpcResult};
use crate::wire::signature::{SignatureKeyring, VerifyMode};

/// What goes back over the link the request came in on.
#[derive(Debug)]
pub enum InboundReply {
    Response(ResponseEnvelope),
    Error(ErrorEnvelope),
    /// Sends are never answered.
    None,
}

pub struct InboundAdapter {
    node_id: NodeId,
    registry: Arc<MessageRegistry>,
    events: EventBus,
    keyring: Arc<SignatureKeyring>,
    verify_mode: VerifyMode,
    /// When set, locally-produced JSON responses are signed with this key.
    sign_key: Option<String>,
}

impl InboundAdapter {
    pub fn new(node_id: NodeId, registry: Arc<MessageRegistry>, events: EventBus) -> Self {
        Self {
            node_id,
            registry,
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

    /// Dispatch one request that terminates here.
    pub async fn receive(&self, origin: &NodeId, envelope: RequestEnvelope) -> InboundReply {
        let started = Instant::now();
        let answerable = envelope.kind.expects_response();

        // Typed parse. An unparseable Call is answered with a protocol
        // error; an unparseable Send can only be logged.
        let message = match self.registry.decode(&envelope.action, &envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(action = %envelope.action, origin = %origin, "inbound parse failed: {e}");
                metrics::counter!("ocpp_messages_dropped_total", "reason" => "parse")
                    .increment(1);
                if !answerable {
                    return InboundReply::None;
                }
                return InboundReply::Error(
                    ErrorEnvelope::new(
                        envelope.request_id.clone(),
                        e.result_code(),
                        e.to_string(),
                    )
                    .answering(&envelope),
                );
            }
        };

        if let Some(payload) = envelope.payload.as_json() {
            if let Err(fault) = self.keyring.verify(
                &envelope.action,
                &envelope.request_id,
                payload,
                &envelope.signatures,
                self.verify_mode,
            ) {
                warn!(action = %envelope.action, origin = %origin,
                    "inbound signature check failed: {fault}");
                if !answerable {
                    return InboundReply::None;
                }
                return InboundReply::Error(
                    ErrorEnvelope::new(
                        envelope.request_id.clone(),
                        ResultCode::SignatureError,
                        fault.to_string(),
                    )
                    .answering(&envelope),
                );
            }
        }

        self.events.publish(Event::RequestReceived(RequestReceivedEvent {
            peer_id: origin.to_string(),
            action: envelope.action.clone(),
            request_id: envelope.request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            timestamp: Utc::now(),
        }));

        // Every handler runs; the first answer in registration order
        // wins. A panicking handler just abstains.
        let handlers = self.registry.handlers(&envelope.action);
        let ctx = RequestContext::new(origin.clone(), envelope.clone());
        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let ctx = ctx.clone();
            let message = message.clone();
            tasks.push(tokio::spawn(async move { handler(ctx, message).await }));
        }

        let mut answer: Option<Payload> = None;
        for task in tasks {
            match task.await {
                Ok(Some(payload)) if answer.is_none() => answer = Some(payload),
                Ok(_) => {}
                Err(e) => {
                    warn!(action = %envelope.action, "request handler panicked: {e}");
                }
            }
        }

        metrics::counter!("ocpp_messages_handled_total", "action" => envelope.action.clone())
            .increment(1);

        if !answerable {
            debug!(action = %envelope.action, origin = %origin, "send dispatched, no response");
            return InboundReply::None;
        }

        let (result, payload) = match answer {
            Some(payload) => (RpcResult::ok(), Some(payload)),
            // Nobody answered. Fall back to the type's Failed default
            // rather than leaving the caller waiting.
            None => match self
                .registry
                .codec(&envelope.action)
                .and_then(|codec| codec.failed_response(&message))
            {
                Some(payload) => (
                    RpcResult::error(ResultCode::GenericError, "no handler produced a response"),
                    Some(payload),
                ),
                None => (
                    RpcResult::error(ResultCode::GenericError, "no handler produced a response"),
                    None,
                ),
            },
        };

        let runtime = started.elapsed();
        self.events.publish(Event::ResponseSent(ResponseSentEvent {
            action: envelope.action.clone(),
            request_id: envelope.request_id.to_string(),
            tracking_id: envelope.tracking.to_string(),
            result: result.code.to_string(),
            runtime_ms: runtime.as_millis() as u64,
            timestamp: Utc::now(),
        }));

        match payload {
            Some(payload) => {
                let mut response =
                    ResponseEnvelope::to(&envelope, payload).with_result(result);
                self.sign(&mut response);
                InboundReply::Response(response)
            }
            None => InboundReply::Error(
                ErrorEnvelope::new(
                    envelope.request_id.clone(),
                    result.code,
                    result.detail.unwrap_or_else(|| "unhandled request".into()),
                )
                .answering(&envelope),
            ),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn sign(&self, response: &mut ResponseEnvelope) {
        let Some(key_id) = self.sign_key.as_deref() else {
            return;
        };
        let Some(value) = response.payload.as_json() else {
            return;
        };
        match self
            .keyring
            .sign(&response.action, &response.request_id, value, key_id)
        {
            Ok(signature) => response.signatures.push(signature),
            Err(fault) => {
                warn!(action = %response.action, "response signing failed: {fault}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::codec::{OcppRequest, OcppResponse};
    use crate::wire::path::Destination;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct EchoRequest {
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct EchoResponse {
        text: String,
    }

    impl OcppRequest for EchoRequest {
        const ACTION: &'static str = "Echo";
        type Response = EchoResponse;

        fn failed_response(&self) -> Option<EchoResponse> {
            Some(EchoResponse { text: "failed".into() })
        }
    }
    impl OcppResponse for EchoResponse {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SilentRequest {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SilentResponse {}

    impl OcppRequest for SilentRequest {
        const ACTION: &'static str = "Silent";
        type Response = SilentResponse;
    }
    impl OcppResponse for SilentResponse {}

    fn adapter() -> (InboundAdapter, Arc<MessageRegistry>) {
        let registry = Arc::new(MessageRegistry::new());
        registry.register::<EchoRequest>();
        registry.register::<SilentRequest>();
        let adapter = InboundAdapter::new(
            NodeId::new("NN-1"),
            registry.clone(),
            EventBus::new(),
        );
        (adapter, registry)
    }

    fn call(action: &str, payload: serde_json::Value) -> RequestEnvelope {
        RequestEnvelope::call(
            action,
            Payload::Json(payload),
            Destination::Node(NodeId::new("NN-1")),
        )
    }

    #[tokio::test]
    async fn first_responding_handler_wins() {
        let (adapter, registry) = adapter();
        registry.handle::<EchoRequest, _, _>(|_ctx, _req| async move { None });
        registry.handle::<EchoRequest, _, _>(|_ctx, req| async move {
            Some(EchoResponse { text: req.text.clone() })
        });

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": "hi"})))
            .await;
        match reply {
            InboundReply::Response(response) => {
                assert!(response.result.is_ok());
                assert_eq!(response.payload.as_json().unwrap()["text"], "hi");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_call_gets_failed_default() {
        let (adapter, _registry) = adapter();

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": "hi"})))
            .await;
        match reply {
            InboundReply::Response(response) => {
                assert_eq!(response.result.code, ResultCode::GenericError);
                assert_eq!(response.payload.as_json().unwrap()["text"], "failed");
            }
            other => panic!("expected failed default, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_call_without_default_is_a_call_error() {
        let (adapter, _registry) = adapter();

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Silent", json!({})))
            .await;
        match reply {
            InboundReply::Error(error) => {
                assert_eq!(error.code, ResultCode::GenericError);
            }
            other => panic!("expected call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_abstains() {
        let (adapter, registry) = adapter();
        registry.handle::<EchoRequest, _, _>(|_ctx, _req| async move { panic!("handler bug") });
        registry.handle::<EchoRequest, _, _>(|_ctx, _req| async move {
            Some(EchoResponse { text: "survivor".into() })
        });

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": "x"})))
            .await;
        match reply {
            InboundReply::Response(response) => {
                assert_eq!(response.payload.as_json().unwrap()["text"], "survivor");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_call_is_answered_with_could_not_parse() {
        let (adapter, _registry) = adapter();

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": 7})))
            .await;
        match reply {
            InboundReply::Error(error) => {
                assert_eq!(error.code, ResultCode::CouldNotParse);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_action_is_could_not_parse() {
        let (adapter, _registry) = adapter();

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Nope", json!({})))
            .await;
        match reply {
            InboundReply::Error(error) => {
                assert_eq!(error.code, ResultCode::CouldNotParse);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_is_never_answered() {
        let (adapter, registry) = adapter();
        registry.handle::<EchoRequest, _, _>(|_ctx, req| async move {
            Some(EchoResponse { text: req.text.clone() })
        });

        let envelope = RequestEnvelope::send(
            "Echo",
            Payload::Json(json!({"text": "fire and forget"})),
            Destination::Node(NodeId::new("NN-1")),
        );
        let reply = adapter.receive(&NodeId::new("CS-1"), envelope).await;
        assert!(matches!(reply, InboundReply::None));
    }

    #[tokio::test]
    async fn required_signature_missing_is_rejected() {
        let registry = Arc::new(MessageRegistry::new());
        registry.register::<EchoRequest>();
        let mut keyring = SignatureKeyring::new();
        keyring.insert("k1", b"secret".to_vec());
        let adapter = InboundAdapter::new(NodeId::new("NN-1"), registry, EventBus::new())
            .with_signature_policy(Arc::new(keyring), VerifyMode::Require, None);

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": "hi"})))
            .await;
        match reply {
            InboundReply::Error(error) => assert_eq!(error.code, ResultCode::SignatureError),
            other => panic!("expected signature error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_is_signed_when_a_key_is_configured() {
        let registry = Arc::new(MessageRegistry::new());
        registry.register::<EchoRequest>();
        registry.handle::<EchoRequest, _, _>(|_ctx, req| async move {
            Some(EchoResponse { text: req.text.clone() })
        });
        let mut keyring = SignatureKeyring::new();
        keyring.insert("k1", b"secret".to_vec());
        let adapter = InboundAdapter::new(NodeId::new("NN-1"), registry, EventBus::new())
            .with_signature_policy(Arc::new(keyring), VerifyMode::Off, Some("k1".into()));

        let reply = adapter
            .receive(&NodeId::new("CS-1"), call("Echo", json!({"text": "hi"})))
            .await;
        match reply {
            InboundReply::Response(response) => {
                assert_eq!(response.signatures.len(), 1);
                assert_eq!(response.signatures[0].key_id, "k1");
            }
            other => panic!("expected signed response, got {other:?}"),
        }
    }
}
