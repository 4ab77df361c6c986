//! Request, response and error envelopes
//!
//! Envelopes are the in-process form of a message: the wire frame plus
//! the metadata the routing core needs (timestamps, tracking id, the
//! path travelled so far, detached signatures, a cancellation token).
//! The [`frame`](crate::wire::frame) module maps them to and from the
//! JSON arrays that actually travel over a link.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::shared::cancel::CancelToken;
use crate::wire::ids::{EventTrackingId, NodeId, RequestId};
use crate::wire::path::{Destination, NetworkPath};
use crate::wire::result::{ResultCode, RpcResult};
use crate::wire::signature::Signature;

// ── Payload ────────────────────────────────────────────────────

/// Payload slot of a frame.
///
/// Binary payloads travel base64-encoded in the JSON slot, so on the
/// wire everything is JSON. `Binary` only exists after a binary codec
/// has decoded the slot (or before it encodes it).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Empty JSON object payload.
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Default::default()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Json(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }

    /// The JSON value that goes into the frame's payload slot.
    pub fn to_wire(&self) -> Value {
        use base64::Engine;
        match self {
            Payload::Json(value) => value.clone(),
            Payload::Binary(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Time a caller waits for a response before giving up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── RequestKind ────────────────────────────────────────────────

/// Whether a request expects a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `[2, ...]`, answered by a CallResult or CallError.
    Call,
    /// `[6, ...]`, fire-and-forget. Never correlated, never answered.
    Send,
}

impl RequestKind {
    pub fn expects_response(&self) -> bool {
        matches!(self, RequestKind::Call)
    }
}

// ── RequestEnvelope ────────────────────────────────────────────

/// A request travelling through the node, inbound or outbound.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub kind: RequestKind,
    pub request_id: RequestId,
    pub action: String,
    pub payload: Payload,
    pub destination: Destination,
    /// Hops traversed so far, origin first.
    pub path: NetworkPath,
    pub timestamp: DateTime<Utc>,
    /// How long the caller waits for the matching response.
    pub timeout: Duration,
    /// Detached signatures popped out of the payload slot.
    pub signatures: Vec<Signature>,
    /// Tracing id shared by every event this message produces.
    pub tracking: EventTrackingId,
    /// Observed by long-running handlers; fired when the caller gives up.
    pub cancel: CancelToken,
}

impl RequestEnvelope {
    pub fn call(
        action: impl Into<String>,
        payload: Payload,
        destination: Destination,
    ) -> Self {
        Self::new(RequestKind::Call, action, payload, destination)
    }

    pub fn send(
        action: impl Into<String>,
        payload: Payload,
        destination: Destination,
    ) -> Self {
        Self::new(RequestKind::Send, action, payload, destination)
    }

    pub fn new(
        kind: RequestKind,
        action: impl Into<String>,
        payload: Payload,
        destination: Destination,
    ) -> Self {
        Self {
            kind,
            request_id: RequestId::generate(),
            action: action.into(),
            payload,
            destination,
            path: NetworkPath::new(),
            timestamp: Utc::now(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            signatures: Vec::new(),
            tracking: EventTrackingId::generate(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Node the request originated from, when the path carries one.
    pub fn origin(&self) -> Option<&NodeId> {
        self.path.origin()
    }

    /// True when `node` is the final destination.
    pub fn is_addressed_to(&self, node: &NodeId) -> bool {
        self.destination.is_final(node)
    }
}

// ── ResponseEnvelope ───────────────────────────────────────────

/// A response to an earlier request.
///
/// `result` is the transport/protocol outcome; the payload may still
/// carry a domain-level status of its own (Accepted, Rejected, ...).
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    /// Action of the originating request. Not on the wire for classic
    /// frames; recovered from the pending-call table.
    pub action: String,
    pub result: RpcResult,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub signatures: Vec<Signature>,
    /// Back-route, present on overlay frames only.
    pub destination: Option<Destination>,
    pub path: NetworkPath,
}

impl ResponseEnvelope {
    /// Successful response answering `request`.
    pub fn to(request: &RequestEnvelope, payload: Payload) -> Self {
        Self {
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            result: RpcResult::ok(),
            payload,
            timestamp: Utc::now(),
            signatures: Vec::new(),
            destination: request.origin().cloned().map(Destination::Node),
            path: NetworkPath::new(),
        }
    }

    pub fn with_result(mut self, result: RpcResult) -> Self {
        self.result = result;
        self
    }
}

// ── ErrorEnvelope ──────────────────────────────────────────────

/// Structured error referencing the original request id.
#[derive(Debug, Clone)]
pub struct ErrorEnvelope {
    pub request_id: RequestId,
    pub code: ResultCode,
    pub description: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    /// Back-route, present on overlay frames only.
    pub destination: Option<Destination>,
    pub path: NetworkPath,
}

impl ErrorEnvelope {
    pub fn new(
        request_id: RequestId,
        code: ResultCode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
            timestamp: Utc::now(),
            destination: None,
            path: NetworkPath::new(),
        }
    }

    pub fn could_not_parse(request_id: RequestId, description: impl Into<String>) -> Self {
        Self::new(request_id, ResultCode::CouldNotParse, description)
    }

    pub fn filtered(request_id: RequestId, description: impl Into<String>) -> Self {
        Self::new(request_id, ResultCode::Filtered, description)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Back-route this error along the reverse of `request`'s path.
    pub fn answering(mut self, request: &RequestEnvelope) -> Self {
        self.destination = request.origin().cloned().map(Destination::Node);
        self
    }

    /// Collapse into the result callers see.
    pub fn to_result(&self) -> RpcResult {
        RpcResult::error(self.code, self.description.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_payload_rides_base64() {
        let payload = Payload::Binary(vec![0x00, 0x01, 0xFF]);
        let wire = payload.to_wire();
        assert_eq!(wire, Value::String("AAH/".to_string()));
    }

    #[test]
    fn response_reverses_origin() {
        let mut request = RequestEnvelope::call(
            "Heartbeat",
            Payload::empty(),
            Destination::Node(NodeId::csms()),
        );
        request.path.push(NodeId::new("CS-1"));
        request.path.push(NodeId::new("NN-1"));

        let response = ResponseEnvelope::to(&request, Payload::empty());
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(
            response.destination,
            Some(Destination::Node(NodeId::new("CS-1")))
        );
        assert!(response.result.is_ok());
    }

    #[test]
    fn send_expects_no_response() {
        let request = RequestEnvelope::send(
            "DataTransfer",
            Payload::empty(),
            Destination::Node(NodeId::new("CS-1")),
        );
        assert!(!request.kind.expects_response());
    }

    #[test]
    fn error_envelope_carries_code() {
        let error = ErrorEnvelope::could_not_parse(RequestId::new("r1"), "bad json");
        let result = error.to_result();
        assert_eq!(result.code, ResultCode::CouldNotParse);
        assert_eq!(result.detail.as_deref(), Some("bad json"));
    }
}
