//! WebSocket surfaces of the node
//!
//! [`ws`] listens for stations and downstream nodes; [`upstream`]
//! dials and maintains the link to the parent node or CSMS.

pub mod upstream;
pub mod ws;

pub use upstream::spawn_upstream_link;
pub use ws::NodeServer;
