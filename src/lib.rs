//! # OCPP Networking Node
//!
//! Message routing core for OCPP overlay networks. The node accepts
//! WebSocket links from charging stations and downstream nodes, answers
//! the requests addressed to itself, and relays everything else hop by
//! hop along routes it learns from the traffic.
//!
//! ## Architecture
//!
//! - **wire**: frames, envelopes, paths, result taxonomy, signatures
//! - **routing**: typed action registry, filters, forwarding decision engine
//! - **correlation**: pending-request tracking with timeouts
//! - **session**: peer links, learned routes, relay back-routes
//! - **adapters**: IN/OUT/FORWARD surfaces on top of a shared transport
//! - **messages**: the built-in OCPP action catalog
//! - **node**: composition root tying the layers together
//! - **server**: WebSocket listener and the upstream dialer

pub mod adapters;
pub mod config;
pub mod correlation;
pub mod events;
pub mod messages;
pub mod node;
pub mod routing;
pub mod server;
pub mod session;
pub mod shared;
pub mod wire;

pub use config::{default_config_path, AppConfig};
pub use node::NetworkingNode;
pub use server::{spawn_upstream_link, NodeServer};

// Re-export the types most embedders touch
pub use adapters::CallResponse;
pub use events::{Event, EventBus};
pub use messages::register_standard_actions;
pub use routing::{DefaultPolicy, MessageRegistry};
pub use shared::ShutdownSignal;
pub use wire::{Destination, NetworkPath, NodeId, RequestId, ResultCode, RpcResult};
