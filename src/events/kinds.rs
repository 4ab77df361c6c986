//! Node events
//!
//! Everything observable the node does surfaces here: peers attaching
//! and detaching, requests moving through the forwarding pipeline, and
//! correlation anomalies. Subscribers get them over the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types broadcast by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A peer attached (charging station, downstream node, or CSMS)
    PeerConnected(PeerConnectedEvent),
    /// A peer link closed
    PeerDisconnected(PeerDisconnectedEvent),
    /// A request arrived and parsed
    RequestReceived(RequestReceivedEvent),
    /// The decision engine finished with a request
    RequestFiltered(RequestFilteredEvent),
    /// The transport finished relaying a forwarded request
    RequestForwarded(RequestForwardedEvent),
    /// A locally-handled request was answered
    ResponseSent(ResponseSentEvent),
    /// An outbound call is about to leave
    RequestSending(RequestSendingEvent),
    /// An outbound call was answered
    ResponseReceived(ResponseReceivedEvent),
    /// A response arrived that nothing was waiting for
    LateResponse(LateResponseEvent),
    /// A node became reachable through a neighbour
    RouteLearned(RouteLearnedEvent),
    /// Something went wrong outside a specific request
    Error(ErrorEvent),
}

impl Event {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::PeerConnected(_) => "peer_connected",
            Event::PeerDisconnected(_) => "peer_disconnected",
            Event::RequestReceived(_) => "request_received",
            Event::RequestFiltered(_) => "request_filtered",
            Event::RequestForwarded(_) => "request_forwarded",
            Event::ResponseSent(_) => "response_sent",
            Event::RequestSending(_) => "request_sending",
            Event::ResponseReceived(_) => "response_received",
            Event::LateResponse(_) => "late_response",
            Event::RouteLearned(_) => "route_learned",
            Event::Error(_) => "error",
        }
    }

    /// Get the peer this event concerns, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Event::PeerConnected(e) => Some(&e.peer_id),
            Event::PeerDisconnected(e) => Some(&e.peer_id),
            Event::RequestReceived(e) => Some(&e.peer_id),
            Event::RequestFiltered(_) => None,
            Event::RequestForwarded(e) => e.next_hop.as_deref(),
            Event::ResponseSent(_) => None,
            Event::RequestSending(e) => Some(&e.destination),
            Event::ResponseReceived(_) => None,
            Event::LateResponse(e) => e.peer_id.as_deref(),
            Event::RouteLearned(e) => Some(&e.node_id),
            Event::Error(e) => e.peer_id.as_deref(),
        }
    }

    /// Get the tracking id tying this event to a message, if any
    pub fn tracking_id(&self) -> Option<&str> {
        match self {
            Event::RequestReceived(e) => Some(&e.tracking_id),
            Event::RequestFiltered(e) => Some(&e.tracking_id),
            Event::RequestForwarded(e) => Some(&e.tracking_id),
            Event::ResponseSent(e) => Some(&e.tracking_id),
            Event::RequestSending(e) => Some(&e.tracking_id),
            Event::ResponseReceived(e) => Some(&e.tracking_id),
            _ => None,
        }
    }
}

/// Peer connected event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnectedEvent {
    pub peer_id: String,
    /// "charging_station", "local_controller" or "csms"
    pub role: String,
    pub remote_addr: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Peer disconnected event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDisconnectedEvent {
    pub peer_id: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Request received event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReceivedEvent {
    /// Link the request arrived on
    pub peer_id: String,
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Request filtered event, carries the final decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFilteredEvent {
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    /// "forward", "reject" or "drop"
    pub decision: String,
    pub reason: Option<String>,
    pub rewritten: bool,
    pub timestamp: DateTime<Utc>,
}

/// Request forwarded event, emitted after the relay send completed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestForwardedEvent {
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    /// Peer the frame actually went to; `None` when the send failed.
    pub next_hop: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Response sent event for locally-dispatched requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSentEvent {
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    pub result: String,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Outbound request sending event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSendingEvent {
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    pub destination: String,
    pub timestamp: DateTime<Utc>,
}

/// Outbound response received event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseReceivedEvent {
    pub action: String,
    pub request_id: String,
    pub tracking_id: String,
    pub result: String,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Late response event: a CallResult or CallError with no pending
/// request and no relay entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LateResponseEvent {
    pub request_id: String,
    pub peer_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Route learned event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLearnedEvent {
    /// The node that became reachable
    pub node_id: String,
    /// The directly-connected peer it is reachable through
    pub via: String,
    pub timestamp: DateTime<Utc>,
}

/// Error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub peer_id: Option<String>,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Wrapper for sending events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventMessage {
    pub fn new(event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_are_stable() {
        let event = Event::LateResponse(LateResponseEvent {
            request_id: "r1".into(),
            peer_id: None,
            timestamp: Utc::now(),
        });
        assert_eq!(event.event_type(), "late_response");
    }

    #[test]
    fn serializes_with_tag_and_data() {
        let event = Event::PeerConnected(PeerConnectedEvent {
            peer_id: "CS-1".into(),
            role: "charging_station".into(),
            remote_addr: Some("10.0.0.7:51012".into()),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PeerConnected");
        assert_eq!(json["data"]["peer_id"], "CS-1");
    }
}
