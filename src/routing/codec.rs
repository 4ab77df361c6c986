//! Typed messages and the codecs that erase them
//!
//! Message definitions live outside the routing core. A message type
//! implements [`OcppRequest`] (pairing it with its action string and
//! response type) and the core moves it around as an [`AnyMessage`],
//! downcasting back at the typed seams: handler entry, filter entry,
//! response selection.
//!
//! The core never parses a payload itself. Each registered action
//! supplies a [`MessageCodec`] that does, which is also where a message
//! type's own "Rejected" and "Failed" defaults come from.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::wire::binary::{BinaryError, BinaryTags};
use crate::wire::envelope::Payload;
use crate::wire::result::ResultCode;

// ── Typed message traits ───────────────────────────────────────

/// A request message type, keyed by its action string.
pub trait OcppRequest: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ACTION: &'static str;
    type Response: OcppResponse;

    /// Type-specific response meaning "nobody handled this". Used so a
    /// dispatched request is never left unanswered.
    fn failed_response(&self) -> Option<Self::Response> {
        None
    }

    /// Type-specific response meaning "a filter turned this away".
    /// Defaults to the failed response.
    fn rejected_response(&self, _reason: &str) -> Option<Self::Response> {
        self.failed_response()
    }
}

/// A response message type.
pub trait OcppResponse: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Requests that ride the BinaryTags encoding instead of JSON.
pub trait BinaryMessage: OcppRequest {
    fn from_tags(tags: BinaryTags) -> Result<Self, BinaryError>;
    fn to_tags(&self) -> BinaryTags;
}

// ── AnyMessage ─────────────────────────────────────────────────

/// A typed request with its type erased for transport through the
/// registry and filter chain.
#[derive(Clone)]
pub struct AnyMessage {
    action: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl AnyMessage {
    pub fn new<M: OcppRequest>(message: M) -> Self {
        Self {
            action: M::ACTION,
            inner: Arc::new(message),
        }
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Recover the typed request. `None` when `M` is not what was
    /// erased, which in a correctly-wired registry means a bug.
    pub fn downcast<M: OcppRequest>(&self) -> Option<Arc<M>> {
        self.inner.clone().downcast::<M>().ok()
    }
}

impl std::fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyMessage")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

// ── MessageCodec ───────────────────────────────────────────────

/// Object-safe parse/serialize contract for one action.
pub trait MessageCodec: Send + Sync {
    fn action(&self) -> &'static str;

    /// Parse a payload slot into the typed request.
    fn decode(&self, payload: &Payload) -> Result<AnyMessage, CodecError>;

    /// Serialize the typed request back into a payload slot.
    fn encode(&self, message: &AnyMessage) -> Result<Payload, CodecError>;

    /// The message type's own rejection response, serialized.
    fn rejected_response(&self, message: &AnyMessage, reason: &str) -> Option<Payload>;

    /// The message type's own failure response, serialized.
    fn failed_response(&self, message: &AnyMessage) -> Option<Payload>;
}

// ── JsonCodec ──────────────────────────────────────────────────

/// Default serde-backed codec for JSON payloads.
pub struct JsonCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> JsonCodec<M> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<M> Default for JsonCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: OcppRequest> MessageCodec for JsonCodec<M> {
    fn action(&self) -> &'static str {
        M::ACTION
    }

    fn decode(&self, payload: &Payload) -> Result<AnyMessage, CodecError> {
        let json = payload.as_json().ok_or(CodecError::ExpectedJson {
            action: M::ACTION,
        })?;
        let message: M = serde_json::from_value(json.clone()).map_err(|e| {
            CodecError::BadPayload {
                action: M::ACTION,
                detail: e.to_string(),
            }
        })?;
        Ok(AnyMessage::new(message))
    }

    fn encode(&self, message: &AnyMessage) -> Result<Payload, CodecError> {
        let typed = downcast_or_err::<M>(message)?;
        let value = serde_json::to_value(&*typed).map_err(|e| CodecError::BadPayload {
            action: M::ACTION,
            detail: e.to_string(),
        })?;
        Ok(Payload::Json(value))
    }

    fn rejected_response(&self, message: &AnyMessage, reason: &str) -> Option<Payload> {
        let typed = message.downcast::<M>()?;
        let response = typed.rejected_response(reason)?;
        serde_json::to_value(&response).ok().map(Payload::Json)
    }

    fn failed_response(&self, message: &AnyMessage) -> Option<Payload> {
        let typed = message.downcast::<M>()?;
        let response = typed.failed_response()?;
        serde_json::to_value(&response).ok().map(Payload::Json)
    }
}

// ── BinaryCodec ────────────────────────────────────────────────

/// Codec for actions whose payload is a BinaryTags frame. On the JSON
/// wire the frame arrives base64-encoded in the payload slot.
pub struct BinaryCodec<M> {
    _marker: PhantomData<fn() -> M>,
}

impl<M> BinaryCodec<M> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<M> Default for BinaryCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: BinaryMessage> MessageCodec for BinaryCodec<M> {
    fn action(&self) -> &'static str {
        M::ACTION
    }

    fn decode(&self, payload: &Payload) -> Result<AnyMessage, CodecError> {
        let bytes = match payload {
            Payload::Binary(bytes) => bytes.clone(),
            Payload::Json(serde_json::Value::String(b64)) => {
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|_| CodecError::BadPayload {
                        action: M::ACTION,
                        detail: "payload is not valid base64".into(),
                    })?
            }
            Payload::Json(_) => {
                return Err(CodecError::ExpectedBinary { action: M::ACTION })
            }
        };

        let tags = BinaryTags::decode(&bytes).map_err(|e| CodecError::BadPayload {
            action: M::ACTION,
            detail: e.to_string(),
        })?;
        let message = M::from_tags(tags).map_err(|e| CodecError::BadPayload {
            action: M::ACTION,
            detail: e.to_string(),
        })?;
        Ok(AnyMessage::new(message))
    }

    fn encode(&self, message: &AnyMessage) -> Result<Payload, CodecError> {
        let typed = downcast_or_err::<M>(message)?;
        Ok(Payload::Binary(typed.to_tags().encode()))
    }

    fn rejected_response(&self, message: &AnyMessage, reason: &str) -> Option<Payload> {
        let typed = message.downcast::<M>()?;
        let response = typed.rejected_response(reason)?;
        serde_json::to_value(&response).ok().map(Payload::Json)
    }

    fn failed_response(&self, message: &AnyMessage) -> Option<Payload> {
        let typed = message.downcast::<M>()?;
        let response = typed.failed_response()?;
        serde_json::to_value(&response).ok().map(Payload::Json)
    }
}

fn downcast_or_err<M: OcppRequest>(message: &AnyMessage) -> Result<Arc<M>, CodecError> {
    message.downcast::<M>().ok_or(CodecError::WrongType {
        expected: M::ACTION,
        got: message.action(),
    })
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload for {action} is not valid: {detail}")]
    BadPayload { action: &'static str, detail: String },

    #[error("{action} expects a JSON object payload")]
    ExpectedJson { action: &'static str },

    #[error("{action} expects a binary payload")]
    ExpectedBinary { action: &'static str },

    #[error("message type mismatch: expected {expected}, got {got}")]
    WrongType {
        expected: &'static str,
        got: &'static str,
    },
}

impl CodecError {
    /// Taxonomy bucket. A payload that will not deserialize into the
    /// action's type could not be parsed; a payload of the wrong
    /// format family parsed fine but is wrongly formed for the action.
    /// A type mismatch can only come from mis-wiring inside the node.
    pub fn result_code(&self) -> ResultCode {
        match self {
            CodecError::BadPayload { .. } => ResultCode::CouldNotParse,
            CodecError::ExpectedJson { .. } | CodecError::ExpectedBinary { .. } => {
                ResultCode::FormationViolation
            }
            CodecError::WrongType { .. } => ResultCode::InternalError,
        }
    }
}
