//! Session management - peer links, route learning, response relaying

pub mod connection;
pub mod registry;
pub mod routes;

pub use connection::{LinkMessage, PeerLink, PeerRole};
pub use registry::PeerRegistry;
pub use routes::{RelayTable, RouteTable};
