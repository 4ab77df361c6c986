//! Action registry
//!
//! Maps action strings to their codec plus whatever handlers and
//! filters are registered for them. Handlers answer requests the node
//! terminates; filters vote on requests the node relays. Registration
//! is concurrent and can happen while traffic is flowing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::error;

use crate::routing::codec::{
    AnyMessage, BinaryCodec, BinaryMessage, CodecError, JsonCodec, MessageCodec, OcppRequest,
};
use crate::routing::filter::{filter_fn, ErasedFilter, FilterDecision};
use crate::shared::cancel::CancelToken;
use crate::wire::envelope::{Payload, RequestEnvelope};
use crate::wire::ids::{EventTrackingId, NodeId, RequestId};
use crate::wire::result::ResultCode;

// ── RequestContext ─────────────────────────────────────────────

/// What a handler or filter sees besides the typed request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Directly-connected peer the request arrived from.
    pub origin: NodeId,
    pub envelope: Arc<RequestEnvelope>,
}

impl RequestContext {
    pub fn new(origin: NodeId, envelope: RequestEnvelope) -> Self {
        Self {
            origin,
            envelope: Arc::new(envelope),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.envelope.request_id
    }

    pub fn action(&self) -> &str {
        &self.envelope.action
    }

    pub fn tracking(&self) -> &EventTrackingId {
        &self.envelope.tracking
    }

    /// Fired when the caller stops waiting; long handlers should
    /// observe it.
    pub fn cancel(&self) -> &CancelToken {
        &self.envelope.cancel
    }
}

// ── Handlers ───────────────────────────────────────────────────

pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Payload>> + Send>>;

/// A registered request handler, erased. Returning `None` means this
/// handler abstains.
pub type ErasedHandler = Arc<dyn Fn(RequestContext, AnyMessage) -> HandlerFuture + Send + Sync>;

/// Wrap a typed async handler into its erased form.
pub fn handler_fn<M, F, Fut>(f: F) -> ErasedHandler
where
    M: OcppRequest,
    F: Fn(RequestContext, Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<M::Response>> + Send + 'static,
{
    Arc::new(move |ctx: RequestContext, any: AnyMessage| {
        let Some(typed) = any.downcast::<M>() else {
            return Box::pin(async { None }) as HandlerFuture;
        };
        let fut = f(ctx, typed);
        Box::pin(async move {
            let response = fut.await?;
            match serde_json::to_value(&response) {
                Ok(value) => Some(Payload::Json(value)),
                Err(e) => {
                    error!(action = M::ACTION, "response serialization failed: {e}");
                    None
                }
            }
        })
    })
}

// ── MessageRegistry ────────────────────────────────────────────

struct RegistryEntry {
    codec: Arc<dyn MessageCodec>,
    handlers: Vec<ErasedHandler>,
    filters: Vec<ErasedFilter>,
}

impl RegistryEntry {
    fn new(codec: Arc<dyn MessageCodec>) -> Self {
        Self {
            codec,
            handlers: Vec::new(),
            filters: Vec::new(),
        }
    }
}

/// Concurrent action table. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MessageRegistry {
    entries: DashMap<&'static str, RegistryEntry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `M`'s action parseable. Idempotent; the first codec wins.
    pub fn register<M: OcppRequest>(&self) {
        self.entries
            .entry(M::ACTION)
            .or_insert_with(|| RegistryEntry::new(Arc::new(JsonCodec::<M>::new())));
    }

    /// Like [`register`](Self::register) for BinaryTags-encoded actions.
    pub fn register_binary<M: BinaryMessage>(&self) {
        self.entries
            .entry(M::ACTION)
            .or_insert_with(|| RegistryEntry::new(Arc::new(BinaryCodec::<M>::new())));
    }

    /// Attach a local handler for `M`. Registers the action if needed.
    pub fn handle<M, F, Fut>(&self, f: F)
    where
        M: OcppRequest,
        F: Fn(RequestContext, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<M::Response>> + Send + 'static,
    {
        self.register::<M>();
        if let Some(mut entry) = self.entries.get_mut(M::ACTION) {
            entry.handlers.push(handler_fn(f));
        }
    }

    /// Attach a forwarding filter for `M`. Registers the action if
    /// needed. Evaluation follows registration order.
    pub fn filter<M, F, Fut>(&self, f: F)
    where
        M: OcppRequest,
        F: Fn(RequestContext, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FilterDecision<M>> + Send + 'static,
    {
        self.register::<M>();
        if let Some(mut entry) = self.entries.get_mut(M::ACTION) {
            entry.filters.push(filter_fn(f));
        }
    }

    pub fn is_registered(&self, action: &str) -> bool {
        self.entries.contains_key(action)
    }

    pub fn codec(&self, action: &str) -> Option<Arc<dyn MessageCodec>> {
        self.entries.get(action).map(|entry| entry.codec.clone())
    }

    pub fn handlers(&self, action: &str) -> Vec<ErasedHandler> {
        self.entries
            .get(action)
            .map(|entry| entry.handlers.clone())
            .unwrap_or_default()
    }

    pub fn filters(&self, action: &str) -> Vec<ErasedFilter> {
        self.entries
            .get(action)
            .map(|entry| entry.filters.clone())
            .unwrap_or_default()
    }

    /// Parse a payload for a registered action.
    pub fn decode(&self, action: &str, payload: &Payload) -> Result<AnyMessage, RegistryError> {
        let codec = self
            .codec(action)
            .ok_or_else(|| RegistryError::UnknownAction(action.to_string()))?;
        Ok(codec.decode(payload)?)
    }

    /// Serialize a typed request back to its wire payload.
    pub fn encode(&self, message: &AnyMessage) -> Result<Payload, RegistryError> {
        let codec = self
            .codec(message.action())
            .ok_or_else(|| RegistryError::UnknownAction(message.action().to_string()))?;
        Ok(codec.encode(message)?)
    }

    /// Registered actions, for diagnostics.
    pub fn actions(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no parser registered for action '{0}'")]
    UnknownAction(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RegistryError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            RegistryError::UnknownAction(_) => ResultCode::CouldNotParse,
            RegistryError::Codec(e) => e.result_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::codec::OcppResponse;
    use crate::wire::path::Destination;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct EchoResponse {
        text: String,
    }

    impl OcppRequest for EchoRequest {
        const ACTION: &'static str = "Echo";
        type Response = EchoResponse;
    }
    impl OcppResponse for EchoResponse {}

    fn context() -> RequestContext {
        RequestContext::new(
            NodeId::new("CS-1"),
            RequestEnvelope::call("Echo", Payload::empty(), Destination::Node(NodeId::csms())),
        )
    }

    #[test]
    fn unknown_action_is_could_not_parse() {
        let registry = MessageRegistry::new();
        let err = registry
            .decode("Nonexistent", &Payload::empty())
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::CouldNotParse);
    }

    #[test]
    fn malformed_payload_is_could_not_parse() {
        let registry = MessageRegistry::new();
        registry.register::<EchoRequest>();
        let err = registry
            .decode("Echo", &Payload::Json(serde_json::json!({"text": 42})))
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::CouldNotParse);
    }

    #[tokio::test]
    async fn handlers_accumulate_in_order() {
        let registry = MessageRegistry::new();
        registry.handle::<EchoRequest, _, _>(|_ctx, _req| async { None });
        registry.handle::<EchoRequest, _, _>(|_ctx, req| async move {
            Some(EchoResponse {
                text: req.text.clone(),
            })
        });

        let handlers = registry.handlers("Echo");
        assert_eq!(handlers.len(), 2);

        let any = AnyMessage::new(EchoRequest { text: "hello".into() });
        assert!(handlers[0](context(), any.clone()).await.is_none());
        let payload = handlers[1](context(), any).await.unwrap();
        assert_eq!(payload.as_json().unwrap()["text"], "hello");
    }

    #[test]
    fn encode_roundtrips_through_codec() {
        let registry = MessageRegistry::new();
        registry.register::<EchoRequest>();
        let any = registry
            .decode("Echo", &Payload::Json(serde_json::json!({"text": "x"})))
            .unwrap();
        let payload = registry.encode(&any).unwrap();
        assert_eq!(payload.as_json().unwrap()["text"], "x");
    }
}
