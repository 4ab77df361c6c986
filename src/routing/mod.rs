//! Message routing core: typed registry, filters, decision engine

pub mod codec;
pub mod decision;
pub mod engine;
pub mod filter;
pub mod registry;

pub use codec::{AnyMessage, BinaryMessage, CodecError, MessageCodec, OcppRequest, OcppResponse};
pub use decision::{DecisionKind, DefaultPolicy, ForwardingDecision, Rejection};
pub use engine::ForwardingEngine;
pub use filter::{FilterDecision, FilterVerdict};
pub use registry::{MessageRegistry, RequestContext};
