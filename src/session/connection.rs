//! Peer link abstraction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::shared::errors::SendError;
use crate::wire::frame::NetworkingMode;
use crate::wire::ids::NodeId;

/// What kind of peer sits on the other end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    /// A charging station, usually speaking classic framing.
    ChargingStation,
    /// Another networking node below us.
    LocalController,
    /// The central system above us.
    Csms,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::ChargingStation => "charging_station",
            PeerRole::LocalController => "local_controller",
            PeerRole::Csms => "csms",
        }
    }
}

/// Outbound frame on its way to a peer.
///
/// Everything leaves as a text frame; binary payloads ride inside the
/// JSON as their base64 rendering.
#[derive(Debug, Clone)]
pub enum LinkMessage {
    Text(String),
}

/// An active link to a directly-connected peer.
#[derive(Debug)]
pub struct PeerLink {
    pub peer_id: NodeId,
    pub role: PeerRole,
    /// Framing this link speaks.
    pub mode: NetworkingMode,
    /// Channel draining into the link's write half.
    pub sender: mpsc::UnboundedSender<LinkMessage>,
    /// When the link was established.
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp.
    pub last_activity: DateTime<Utc>,
}

impl PeerLink {
    pub fn new(
        peer_id: NodeId,
        role: PeerRole,
        mode: NetworkingMode,
        sender: mpsc::UnboundedSender<LinkMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            role,
            mode,
            sender,
            connected_at: now,
            last_activity: now,
        }
    }

    /// Queue a text frame for this peer.
    pub fn send_text(&self, text: String) -> Result<(), SendError> {
        self.sender
            .send(LinkMessage::Text(text))
            .map_err(|_| SendError::LinkClosed(self.peer_id.clone()))
    }

    /// Update last activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Check if the link has gone quiet for too long.
    pub fn is_stale(&self, timeout_seconds: i64) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(self.last_activity)
            .num_seconds();
        elapsed > timeout_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_into_closed_channel_reports_link_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let link = PeerLink::new(
            NodeId::new("CS-1"),
            PeerRole::ChargingStation,
            NetworkingMode::Standard,
            tx,
        );
        assert!(matches!(
            link.send_text("[2,\"r\",\"Heartbeat\",{}]".into()),
            Err(SendError::LinkClosed(_))
        ));
    }

    #[test]
    fn fresh_link_is_not_stale() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = PeerLink::new(
            NodeId::new("CS-1"),
            PeerRole::ChargingStation,
            NetworkingMode::Standard,
            tx,
        );
        assert!(!link.is_stale(60));
    }
}
