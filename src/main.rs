//!
//! OCPP networking node binary. Reads configuration from a TOML file
//! (~/.config/ocpp-netnode/config.toml), opens the WebSocket listener
//! and, when configured, dials the upstream parent.

use std::sync::Arc;

use tracing::{error, info};

use ocpp_netnode::config::AppConfig;
use ocpp_netnode::shared::ShutdownSignal;
use ocpp_netnode::{
    default_config_path, register_standard_actions, spawn_upstream_link, NetworkingNode,
    NodeServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("NETNODE_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let cfg = match AppConfig::load(&config_path) {
        Ok(cfg) => {
            // Initialize logging with configured level
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
                )
                .init();
            info!("Configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            error!("Failed to load config: {}. Using defaults.", e);
            AppConfig::default()
        }
    };

    info!("Starting OCPP networking node {}...", cfg.node.id);

    // ── Prometheus metrics (must be installed before any metrics calls) ──
    if cfg.metrics.enabled {
        let metrics_addr: std::net::SocketAddr = cfg.metrics_address().parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .expect("Failed to install Prometheus metrics exporter");
        info!("📊 Prometheus metrics exposed on http://{}/metrics", metrics_addr);
    }

    // ── Assemble the node ──────────────────────────────────────
    let node = Arc::new(NetworkingNode::from_config(&cfg)?);
    register_standard_actions(node.registry());

    // Start listening for shutdown signals (SIGTERM, SIGINT)
    let shutdown = ShutdownSignal::new();
    shutdown.start_signal_listener();

    node.spawn_maintenance(shutdown.clone());

    if cfg.upstream.enabled {
        spawn_upstream_link(node.clone(), cfg.upstream.clone(), shutdown.clone());
    }

    // ── WebSocket listener ─────────────────────────────────────
    let server = NodeServer::new(node.clone(), cfg.listen_address()).with_shutdown(shutdown);

    info!("🚀 Node started. Press Ctrl+C to shutdown gracefully.");

    if let Err(e) = server.run().await {
        error!("WebSocket server error: {}", e);
    }

    // Perform final cleanup
    info!("🧹 Performing final cleanup...");
    node.shutdown("node shutting down");

    info!("👋 OCPP networking node shutdown complete");
    Ok(())
}
