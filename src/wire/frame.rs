//! OCPP-J message framing, classic and overlay
//!
//! Two framings share one parser. The classic OCPP-J shapes are what
//! charging stations speak:
//!
//! - **Call**       `[2, "<requestId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<requestId>", {<payload>}]`
//! - **CallError**  `[4, "<requestId>", "<code>", "<description>", {<details>}]`
//! - **Send**       `[6, "<requestId>", "<action>", {<payload>}]` (fire-and-forget)
//!
//! Overlay framing adds explicit routing so intermediary nodes can relay
//! without terminating the message. Destination and the traversed path
//! come first, then the classic tail:
//!
//! - **Call**       `[2, <destination>, [<path>...], "<requestId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, <destination>, [<path>...], "<requestId>", {<payload>}]`
//! - **CallError**  `[4, <destination>, [<path>...], "<requestId>", "<code>", "<description>", {<details>}]`
//! - **Send**       `[6, <destination>, [<path>...], "<requestId>", "<action>", {<payload>}]`
//!
//! The message type id plus the array length picks the framing, so a
//! single link could even mix both. An optional `signatures` array
//! inside an object payload is popped into the envelope on parse and
//! re-injected on serialize; payloads that are not JSON objects cannot
//! carry one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::wire::envelope::{
    ErrorEnvelope, Payload, RequestEnvelope, RequestKind, ResponseEnvelope,
};
use crate::wire::ids::{NodeId, RequestId};
use crate::wire::path::{Destination, NetworkPath};
use crate::wire::result::{ResultCode, RpcResult};
use crate::wire::signature::Signature;

// ── Message-type constants ─────────────────────────────────────

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;
const MSG_TYPE_SEND: u64 = 6;

// ── NetworkingMode ─────────────────────────────────────────────

/// Which framing a link speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkingMode {
    /// Classic OCPP-J shapes, no routing fields.
    #[default]
    Standard,
    /// Extended shapes with destination and network path.
    OverlayNetwork,
}

// ── Frame ──────────────────────────────────────────────────────

/// A parsed wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Call or Send.
    Request(RequestEnvelope),
    /// CallResult.
    Response(ResponseEnvelope),
    /// CallError.
    Error(ErrorEnvelope),
}

impl Frame {
    // ── Parsing ────────────────────────────────────────────

    /// Parse raw JSON text into a frame, auto-detecting the framing.
    ///
    /// Classic requests carry no destination; they get the CSMS alias
    /// as the implied upward route, which the dispatch layer may
    /// override based on where the frame arrived.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

        if arr.is_empty() {
            return Err(FrameError::EmptyArray);
        }

        let msg_type = arr[0].as_u64().ok_or(FrameError::InvalidMessageType)?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_request(&arr, RequestKind::Call),
            MSG_TYPE_SEND => Self::parse_request(&arr, RequestKind::Send),
            MSG_TYPE_CALL_RESULT => Self::parse_response(&arr),
            MSG_TYPE_CALL_ERROR => Self::parse_error(&arr),
            _ => Err(FrameError::UnknownMessageType(msg_type)),
        }
    }

    fn parse_request(arr: &[Value], kind: RequestKind) -> Result<Self, FrameError> {
        let kind_name = match kind {
            RequestKind::Call => "Call",
            RequestKind::Send => "Send",
        };

        // Classic is [type, id, action, payload]; overlay inserts
        // destination and path after the type.
        let (destination, path, tail) = match arr.len() {
            4 => (None, NetworkPath::new(), &arr[1..]),
            6 => {
                let destination = parse_destination(&arr[1])?;
                let path = parse_path(&arr[2])?;
                (Some(destination), path, &arr[3..])
            }
            got => return Err(FrameError::BadLength { kind: kind_name, got }),
        };

        let request_id = parse_id(&tail[0])?;
        let action = tail[1]
            .as_str()
            .ok_or(FrameError::FieldTypeMismatch("action must be a string"))?
            .to_string();
        let mut payload = tail[2].clone();
        let signatures = pop_signatures(&mut payload)?;

        let mut envelope = RequestEnvelope::new(
            kind,
            action,
            Payload::Json(payload),
            destination.unwrap_or(Destination::Node(NodeId::csms())),
        );
        envelope.request_id = request_id;
        envelope.path = path;
        envelope.signatures = signatures;
        Ok(Self::Request(envelope))
    }

    fn parse_response(arr: &[Value]) -> Result<Self, FrameError> {
        let (destination, path, tail) = match arr.len() {
            3 => (None, NetworkPath::new(), &arr[1..]),
            5 => {
                let destination = parse_optional_destination(&arr[1])?;
                let path = parse_path(&arr[2])?;
                (destination, path, &arr[3..])
            }
            got => return Err(FrameError::BadLength { kind: "CallResult", got }),
        };

        let request_id = parse_id(&tail[0])?;
        let mut payload = tail
            .get(1)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));
        let signatures = pop_signatures(&mut payload)?;

        Ok(Self::Response(ResponseEnvelope {
            request_id,
            action: String::new(),
            result: RpcResult::ok(),
            payload: Payload::Json(payload),
            timestamp: chrono::Utc::now(),
            signatures,
            destination,
            path,
        }))
    }

    fn parse_error(arr: &[Value]) -> Result<Self, FrameError> {
        // Classic tolerates a missing details slot; overlay is exact.
        let (destination, path, tail) = match arr.len() {
            4 | 5 => (None, NetworkPath::new(), &arr[1..]),
            7 => {
                let destination = parse_optional_destination(&arr[1])?;
                let path = parse_path(&arr[2])?;
                (destination, path, &arr[3..])
            }
            got => return Err(FrameError::BadLength { kind: "CallError", got }),
        };

        let request_id = parse_id(&tail[0])?;
        let wire_code = tail.get(1).and_then(|v| v.as_str()).unwrap_or("InternalError");
        let description = tail
            .get(2)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let details = tail
            .get(3)
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        // Unrecognized peer dialects collapse to GenericError with the
        // original code kept in front of the description.
        let (code, description) = match ResultCode::parse(wire_code) {
            Some(code) => (code, description),
            None => (
                ResultCode::GenericError,
                format!("{wire_code}: {description}"),
            ),
        };

        let mut envelope = ErrorEnvelope::new(request_id, code, description);
        envelope.details = details;
        envelope.destination = destination;
        envelope.path = path;
        Ok(Self::Error(envelope))
    }

    // ── Serialization ──────────────────────────────────────

    /// Serialize this frame to JSON text in the given framing.
    pub fn serialize(&self, mode: NetworkingMode) -> String {
        match self {
            Self::Request(envelope) => encode_request(envelope, mode),
            Self::Response(envelope) => encode_response(envelope, mode),
            Self::Error(envelope) => encode_error(envelope, mode),
        }
    }

    // ── Helpers ────────────────────────────────────────────

    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Request(envelope) => &envelope.request_id,
            Self::Response(envelope) => &envelope.request_id,
            Self::Error(envelope) => &envelope.request_id,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

/// Encode a request in classic or overlay framing.
pub fn encode_request(envelope: &RequestEnvelope, mode: NetworkingMode) -> String {
    let msg_type = match envelope.kind {
        RequestKind::Call => MSG_TYPE_CALL,
        RequestKind::Send => MSG_TYPE_SEND,
    };
    let payload = wire_payload(&envelope.payload, &envelope.signatures);

    let arr = match mode {
        NetworkingMode::Standard => Value::Array(vec![
            Value::Number(msg_type.into()),
            Value::String(envelope.request_id.to_string()),
            Value::String(envelope.action.clone()),
            payload,
        ]),
        NetworkingMode::OverlayNetwork => Value::Array(vec![
            Value::Number(msg_type.into()),
            to_value(&envelope.destination),
            to_value(&envelope.path),
            Value::String(envelope.request_id.to_string()),
            Value::String(envelope.action.clone()),
            payload,
        ]),
    };

    // serde_json::to_string on a Value never fails
    serde_json::to_string(&arr).unwrap()
}

/// Encode a response in classic or overlay framing.
pub fn encode_response(envelope: &ResponseEnvelope, mode: NetworkingMode) -> String {
    let payload = wire_payload(&envelope.payload, &envelope.signatures);

    let arr = match mode {
        NetworkingMode::Standard => Value::Array(vec![
            Value::Number(MSG_TYPE_CALL_RESULT.into()),
            Value::String(envelope.request_id.to_string()),
            payload,
        ]),
        NetworkingMode::OverlayNetwork => Value::Array(vec![
            Value::Number(MSG_TYPE_CALL_RESULT.into()),
            envelope
                .destination
                .as_ref()
                .map(to_value)
                .unwrap_or(Value::Null),
            to_value(&envelope.path),
            Value::String(envelope.request_id.to_string()),
            payload,
        ]),
    };

    serde_json::to_string(&arr).unwrap()
}

/// Encode an error in classic or overlay framing.
pub fn encode_error(envelope: &ErrorEnvelope, mode: NetworkingMode) -> String {
    let arr = match mode {
        NetworkingMode::Standard => Value::Array(vec![
            Value::Number(MSG_TYPE_CALL_ERROR.into()),
            Value::String(envelope.request_id.to_string()),
            Value::String(envelope.code.as_str().to_string()),
            Value::String(envelope.description.clone()),
            envelope.details.clone(),
        ]),
        NetworkingMode::OverlayNetwork => Value::Array(vec![
            Value::Number(MSG_TYPE_CALL_ERROR.into()),
            envelope
                .destination
                .as_ref()
                .map(to_value)
                .unwrap_or(Value::Null),
            to_value(&envelope.path),
            Value::String(envelope.request_id.to_string()),
            Value::String(envelope.code.as_str().to_string()),
            Value::String(envelope.description.clone()),
            envelope.details.clone(),
        ]),
    };

    serde_json::to_string(&arr).unwrap()
}

// ── Slot parsing ───────────────────────────────────────────────

fn parse_id(value: &Value) -> Result<RequestId, FrameError> {
    value
        .as_str()
        .map(RequestId::from)
        .ok_or(FrameError::FieldTypeMismatch("requestId must be a string"))
}

fn parse_destination(value: &Value) -> Result<Destination, FrameError> {
    serde_json::from_value(value.clone()).map_err(|_| {
        FrameError::FieldTypeMismatch("destination must be a node id or a hop array")
    })
}

fn parse_optional_destination(value: &Value) -> Result<Option<Destination>, FrameError> {
    if value.is_null() {
        return Ok(None);
    }
    parse_destination(value).map(Some)
}

fn parse_path(value: &Value) -> Result<NetworkPath, FrameError> {
    serde_json::from_value(value.clone())
        .map_err(|_| FrameError::FieldTypeMismatch("networkPath must be an array of node ids"))
}

fn pop_signatures(payload: &mut Value) -> Result<Vec<Signature>, FrameError> {
    let Some(object) = payload.as_object_mut() else {
        return Ok(Vec::new());
    };
    let Some(raw) = object.remove("signatures") else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw).map_err(|_| {
        FrameError::FieldTypeMismatch("signatures must be an array of signature objects")
    })
}

fn wire_payload(payload: &Payload, signatures: &[Signature]) -> Value {
    let mut slot = payload.to_wire();
    if !signatures.is_empty() {
        if let Some(object) = slot.as_object_mut() {
            // to_value on plain structs never fails
            object.insert("signatures".into(), serde_json::to_value(signatures).unwrap());
        }
    }
    slot
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap()
}

// ── Errors ─────────────────────────────────────────────────────

/// Errors that can occur when parsing a wire frame.
#[derive(Debug)]
pub enum FrameError {
    InvalidJson(String),
    EmptyArray,
    InvalidMessageType,
    UnknownMessageType(u64),
    BadLength { kind: &'static str, got: usize },
    FieldTypeMismatch(&'static str),
}

impl FrameError {
    /// Taxonomy bucket: text that is not JSON could not be parsed at
    /// all; a well-formed array with the wrong shape is a formation
    /// violation.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::InvalidJson(_) => ResultCode::CouldNotParse,
            _ => ResultCode::FormationViolation,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "Invalid JSON: {}", msg),
            Self::EmptyArray => write!(f, "Empty message array"),
            Self::InvalidMessageType => write!(f, "Message type is not a number"),
            Self::UnknownMessageType(t) => write!(f, "Unknown message type: {}", t),
            Self::BadLength { kind, got } => {
                write!(f, "Unexpected {} frame length: {}", kind, got)
            }
            Self::FieldTypeMismatch(msg) => write!(f, "Field type mismatch: {}", msg),
        }
    }
}

impl std::error::Error for FrameError {}
