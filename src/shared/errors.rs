use thiserror::Error;

use crate::wire::ids::NodeId;
use crate::wire::result::RpcResult;

/// Why a frame could not be handed to the transport.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("No route to {0}")]
    NoRoute(NodeId),

    #[error("Peer {0} is not connected")]
    PeerOffline(NodeId),

    #[error("Link to {0} is closed")]
    LinkClosed(NodeId),
}

impl From<&SendError> for RpcResult {
    fn from(error: &SendError) -> Self {
        RpcResult::from_send_failure(error.to_string())
    }
}

/// Top-level failures starting or running the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
