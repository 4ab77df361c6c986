//! WebSocket server for peer connections
//!
//! Charging stations connect on `/ocpp/{station_id}` and speak classic
//! framing; downstream networking nodes connect on `/nn/{node_id}` and
//! speak the overlay framing. Each accepted socket becomes one link in
//! the peer registry, with a write half drained from the link channel
//! and a read half feeding frames into [`NetworkingNode::dispatch_text`].

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::node::NetworkingNode;
use crate::session::connection::{LinkMessage, PeerRole};
use crate::shared::shutdown::ShutdownSignal;
use crate::wire::frame::NetworkingMode;
use crate::wire::ids::NodeId;

/// OCPP 2.0.1 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// WebSocket front door of a networking node.
pub struct NodeServer {
    node: Arc<NetworkingNode>,
    listen_address: String,
    shutdown_signal: Option<ShutdownSignal>,
}

impl NodeServer {
    pub fn new(node: Arc<NetworkingNode>, listen_address: impl Into<String>) -> Self {
        Self {
            node,
            listen_address: listen_address.into(),
            shutdown_signal: None,
        }
    }

    /// Set the shutdown signal for graceful shutdown
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(signal);
        self
    }

    /// Start the WebSocket server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = &self.listen_address;
        let listener = TcpListener::bind(addr).await?;

        info!("🔌 Networking node {} listening on ws://{}", self.node.node_id(), addr);
        info!("   Charging stations connect to: ws://{}/ocpp/{{station_id}}", addr);
        info!("   Downstream nodes connect to:  ws://{}/nn/{{node_id}}", addr);

        if let Some(ref shutdown) = self.shutdown_signal {
            self.run_with_shutdown(listener, shutdown.clone()).await
        } else {
            self.run_loop(listener).await
        }
    }

    /// Run the accept loop without shutdown support
    async fn run_loop(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        while let Ok((stream, addr)) = listener.accept().await {
            self.spawn_connection(stream, addr);
        }
        Ok(())
    }

    /// Run the accept loop with shutdown support
    async fn run_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: ShutdownSignal,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("🛑 WebSocket server received shutdown signal");
                    self.graceful_shutdown().await;
                    return Ok(());
                }
            }
        }
    }

    /// Spawn a connection handler task
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let node = self.node.clone();
        let shutdown = self.shutdown_signal.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, node, shutdown).await {
                error!("Connection error from {}: {}", addr, e);
            }
        });
    }

    /// Perform graceful shutdown
    async fn graceful_shutdown(&self) {
        let connected = self.node.peers().connected_ids();
        let count = connected.len();

        if count > 0 {
            info!("📢 Closing {} peer links...", count);
        }

        // Connection tasks observe the shutdown signal and close their
        // sockets; give them a moment before force-detaching.
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        for peer_id in connected {
            self.node.detach_peer(&peer_id, Some("server shutdown"));
        }

        info!("✅ WebSocket server shutdown complete");
    }
}

/// What a connection's path says about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkIdentity {
    peer_id: NodeId,
    role: PeerRole,
    mode: NetworkingMode,
}

impl LinkIdentity {
    fn station(id: &str) -> Self {
        Self {
            peer_id: NodeId::new(id),
            role: PeerRole::ChargingStation,
            mode: NetworkingMode::Standard,
        }
    }
}

/// Extract the peer identity from the WebSocket request path.
/// Expected formats: `/ocpp/{station_id}`, `/nn/{node_id}`, or a bare
/// `/{station_id}`.
fn identify_link(path: &str) -> Option<LinkIdentity> {
    let path = path.trim_start_matches('/');

    // Downstream networking nodes speak the overlay framing.
    if let Some(id) = path.strip_prefix("nn/") {
        let id = id.trim_start_matches('/');
        if !id.is_empty() {
            return Some(LinkIdentity {
                peer_id: NodeId::new(id),
                role: PeerRole::LocalController,
                mode: NetworkingMode::OverlayNetwork,
            });
        }
        return None;
    }

    if let Some(id) = path.strip_prefix("ocpp/") {
        let id = id.trim_start_matches('/');
        if !id.is_empty() {
            return Some(LinkIdentity::station(id));
        }
        return None;
    }

    // Fallback: use path directly as a station ID if it has no '/'
    if !path.is_empty() && !path.contains('/') {
        return Some(LinkIdentity::station(path));
    }

    None
}

/// Handle a WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    node: Arc<NetworkingNode>,
    shutdown: Option<ShutdownSignal>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("New connection from: {}", addr);

    // Track the peer identity from the handshake
    let mut identity: Option<LinkIdentity> = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        let path = req.uri().path();
        info!("WebSocket handshake from: {}, path: {}", addr, path);

        // Check for OCPP subprotocol in Sec-WebSocket-Protocol header
        let requested_protocols = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let supports_ocpp = requested_protocols
            .split(',')
            .map(|s| s.trim())
            .any(|p| p == OCPP_SUBPROTOCOL);

        if supports_ocpp {
            // Echo the accepted subprotocol in the response
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                OCPP_SUBPROTOCOL.parse().unwrap(),
            );
        } else if !requested_protocols.is_empty() {
            warn!(
                "Client does not offer {}, requested: {}",
                OCPP_SUBPROTOCOL, requested_protocols
            );
            // Still accept the connection; framing is decided by path
        }

        identity = Some(
            identify_link(path)
                // No usable path: treat as an anonymous station
                .unwrap_or_else(|| LinkIdentity::station(&format!("CP_{}", addr.port()))),
        );
        Ok(response)
    })
    .await?;

    // The closure always assigns before the handshake completes
    let identity = identity.unwrap_or_else(|| LinkIdentity::station(&format!("CP_{}", addr.port())));
    let peer_id = identity.peer_id.clone();

    info!(
        "[{}] Connected from {} ({}, {:?} framing)",
        peer_id,
        addr,
        identity.role.as_str(),
        identity.mode
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Register the link; the returned channel feeds the write half
    let mut outbox = node.attach_peer(
        peer_id.clone(),
        identity.role,
        identity.mode,
        Some(addr.to_string()),
    );

    // Spawn task to drain outgoing frames
    let peer_send = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let LinkMessage::Text(text) = message;
            info!("[{}] -> {}", peer_send, text);
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                error!("[{}] Send error: {}", peer_send, e);
                break;
            }
        }
    });

    // Handle incoming frames
    let peer_recv = peer_id.clone();
    let dispatch_node = node.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    info!("[{}] <- {}", peer_recv, text);
                    dispatch_node.dispatch_text(&peer_recv, &text).await;
                }
                Ok(Message::Ping(_)) => {
                    // Pong is sent automatically by tungstenite
                    dispatch_node.peers().touch(&peer_recv);
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    info!("[{}] Close frame received: {:?}", peer_recv, frame);
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(
                        "[{}] Binary WebSocket frame received ({} bytes), ignoring",
                        peer_recv,
                        data.len()
                    );
                }
                Ok(Message::Frame(_)) => {
                    // Raw frame, ignore
                }
                Err(e) => {
                    error!("[{}] WebSocket error: {}", peer_recv, e);
                    break;
                }
            }
        }
    });

    // Wait for tasks or shutdown signal
    if let Some(shutdown) = shutdown {
        tokio::select! {
            _ = send_task => {},
            _ = recv_task => {},
            _ = shutdown.wait() => {
                info!("[{}] Connection closing due to server shutdown", peer_id);
            }
        }
    } else {
        tokio::select! {
            _ = send_task => {},
            _ = recv_task => {},
        }
    }

    node.detach_peer(&peer_id, Some("connection closed"));
    info!("[{}] Disconnected", peer_id);

    Ok(())
}
