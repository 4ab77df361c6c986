//! Message processing adapters
//!
//! Three consumption patterns sit on top of the shared wire and
//! routing layers: IN handles requests that terminate here, OUT
//! originates requests, FORWARD relays everything else. They share
//! the transport, which turns envelopes into frames on a link.

pub mod forward;
pub mod inbound;
pub mod outbound;
pub mod transport;

pub use forward::{ForwardAdapter, RelayOutcome};
pub use inbound::{InboundAdapter, InboundReply};
pub use outbound::{CallResponse, OutboundAdapter};
pub use transport::NodeTransport;
