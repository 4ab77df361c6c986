//! Peer registry - manages active links

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::mpsc;

use super::connection::{LinkMessage, PeerLink, PeerRole};
use crate::shared::errors::SendError;
use crate::wire::frame::NetworkingMode;
use crate::wire::ids::NodeId;

/// Active links indexed by peer id.
#[derive(Default)]
pub struct PeerRegistry {
    links: DashMap<NodeId, PeerLink>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new link. A reconnecting peer replaces its old link;
    /// the stale write half closes when its channel drops.
    pub fn register(
        &self,
        peer_id: NodeId,
        role: PeerRole,
        mode: NetworkingMode,
        sender: mpsc::UnboundedSender<LinkMessage>,
    ) {
        let link = PeerLink::new(peer_id.clone(), role, mode, sender);
        if self.links.insert(peer_id.clone(), link).is_some() {
            warn!("Peer {} reconnected, replacing previous link", peer_id);
        } else {
            info!("Peer link registered: {} ({})", peer_id, role.as_str());
        }
    }

    /// Unregister a link.
    pub fn unregister(&self, peer_id: &NodeId) {
        if self.links.remove(peer_id).is_some() {
            info!("Peer link unregistered: {}", peer_id);
        }
    }

    /// Queue a text frame for a directly-connected peer.
    pub fn send_text(&self, peer_id: &NodeId, text: String) -> Result<(), SendError> {
        match self.links.get(peer_id) {
            Some(link) => link.send_text(text),
            None => Err(SendError::PeerOffline(peer_id.clone())),
        }
    }

    /// Update activity timestamp for a link.
    pub fn touch(&self, peer_id: &NodeId) {
        if let Some(mut link) = self.links.get_mut(peer_id) {
            link.touch();
        }
    }

    pub fn is_connected(&self, peer_id: &NodeId) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Framing the link speaks, when connected.
    pub fn mode_of(&self, peer_id: &NodeId) -> Option<NetworkingMode> {
        self.links.get(peer_id).map(|link| link.mode)
    }

    pub fn role_of(&self, peer_id: &NodeId) -> Option<PeerRole> {
        self.links.get(peer_id).map(|link| link.role)
    }

    /// The first connected CSMS link, i.e. the default upward hop.
    pub fn upstream(&self) -> Option<NodeId> {
        self.links
            .iter()
            .find(|link| link.role == PeerRole::Csms)
            .map(|link| link.peer_id.clone())
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.links.len()
    }

    /// Peers whose links have gone quiet for longer than
    /// `timeout_seconds`.
    pub fn stale_peers(&self, timeout_seconds: i64) -> Vec<NodeId> {
        self.links
            .iter()
            .filter(|link| link.is_stale(timeout_seconds))
            .map(|link| link.peer_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_peer(registry: &PeerRegistry, id: &str, role: PeerRole) {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        registry.register(NodeId::new(id), role, NetworkingMode::Standard, tx);
    }

    #[test]
    fn send_to_unknown_peer_is_offline() {
        let registry = PeerRegistry::new();
        let err = registry
            .send_text(&NodeId::new("CS-9"), "[]".into())
            .unwrap_err();
        assert!(matches!(err, SendError::PeerOffline(_)));
    }

    #[test]
    fn upstream_finds_the_csms_link() {
        let registry = PeerRegistry::new();
        register_peer(&registry, "CS-1", PeerRole::ChargingStation);
        assert_eq!(registry.upstream(), None);

        register_peer(&registry, "CSMS", PeerRole::Csms);
        assert_eq!(registry.upstream(), Some(NodeId::csms()));
    }

    #[test]
    fn reconnect_replaces_link() {
        let registry = PeerRegistry::new();
        register_peer(&registry, "CS-1", PeerRole::ChargingStation);
        register_peer(&registry, "CS-1", PeerRole::ChargingStation);
        assert_eq!(registry.count(), 1);
    }
}
