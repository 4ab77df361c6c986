//! Identifier newtypes used throughout the envelope model
//!
//! All three are string-backed and serde-transparent so they serialize
//! exactly like the plain strings OCPP-J carries on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── RequestId ──────────────────────────────────────────────────

/// Unique id correlating a request to its response.
///
/// Caller-chosen or generated; must be unique among the requests that
/// are concurrently outstanding on a given link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── NodeId ─────────────────────────────────────────────────────

/// Logical identifier of a network node: a charging station, a
/// networking node, or the CSMS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

/// Well-known alias for "whatever central system is upstream".
pub const CSMS_NODE_ID: &str = "CSMS";

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The well-known CSMS alias.
    pub fn csms() -> Self {
        Self(CSMS_NODE_ID.to_string())
    }

    pub fn is_csms(&self) -> bool {
        self.0 == CSMS_NODE_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── EventTrackingId ────────────────────────────────────────────

/// Correlates logically-related messages for tracing.
///
/// Generated once when a message first enters this node and attached to
/// every event the node emits while processing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrip() {
        let id = RequestId::new("CS-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"CS-42\"");
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn csms_alias() {
        assert!(NodeId::csms().is_csms());
        assert!(!NodeId::new("CS-1").is_csms());
    }
}
