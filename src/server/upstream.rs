//! Upstream link maintenance
//!
//! Dials the parent node or CSMS and keeps the link alive: one
//! connection attempt after another with a fixed pause between them,
//! each established socket registered as the CSMS-role peer and
//! pumped until it drops or shutdown triggers.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, Uri};
use tokio_tungstenite::tungstenite::Message;

use crate::config::UpstreamConfig;
use crate::node::NetworkingNode;
use crate::session::connection::{LinkMessage, PeerRole};
use crate::shared::shutdown::ShutdownSignal;
use crate::wire::frame::NetworkingMode;
use crate::wire::ids::NodeId;

/// OCPP 2.0.1 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Dial the configured upstream and keep the link alive until
/// shutdown. Returns immediately; the work runs in a spawned task.
pub fn spawn_upstream_link(
    node: Arc<NetworkingNode>,
    config: UpstreamConfig,
    shutdown: ShutdownSignal,
) {
    tokio::spawn(async move {
        let retry = Duration::from_secs(config.reconnect_seconds.max(1));
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match run_link(&node, &config).await {
                Ok(()) => info!("Upstream link to {} closed", config.id),
                Err(e) => warn!("Upstream link failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!("Upstream dialer stopped");
    });
}

/// One connection lifetime: dial, register, pump until the socket drops.
async fn run_link(
    node: &Arc<NetworkingNode>,
    config: &UpstreamConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let uri: Uri = config.url.parse()?;
    let request = Request::builder()
        .uri(&config.url)
        .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
        .header(header::HOST, uri.host().unwrap_or("localhost"))
        .body(())?;

    let (ws_stream, response) = connect_async(request).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "Upstream did not accept {}, got: {:?}",
            OCPP_SUBPROTOCOL, accepted
        );
    }

    let peer_id = NodeId::new(&config.id);
    let mode = if config.overlay {
        NetworkingMode::OverlayNetwork
    } else {
        NetworkingMode::Standard
    };

    info!("📡 Upstream link established: {} ({})", config.url, peer_id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut outbox = node.attach_peer(peer_id.clone(), PeerRole::Csms, mode, None);

    let send_peer = peer_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let LinkMessage::Text(text) = message;
            info!("[{}] -> {}", send_peer, text);
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                error!("[{}] Send error: {}", send_peer, e);
                break;
            }
        }
    });

    let recv_peer = peer_id.clone();
    let recv_node = node.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    info!("[{}] <- {}", recv_peer, text);
                    recv_node.dispatch_text(&recv_peer, &text).await;
                }
                Ok(Message::Ping(_)) => {
                    recv_node.peers().touch(&recv_peer);
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(frame)) => {
                    info!("[{}] Close frame received: {:?}", recv_peer, frame);
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(
                        "[{}] Binary WebSocket frame received ({} bytes), ignoring",
                        recv_peer,
                        data.len()
                    );
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    error!("[{}] WebSocket error: {}", recv_peer, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    node.detach_peer(&peer_id, Some("upstream link lost"));
    Ok(())
}
