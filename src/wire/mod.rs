//! Wire-level message model: ids, envelopes, framing, signatures

pub mod binary;
pub mod envelope;
pub mod frame;
pub mod ids;
pub mod path;
pub mod result;
pub mod signature;

pub use binary::{BinaryFormat, BinaryTags};
pub use envelope::{
    ErrorEnvelope, Payload, RequestEnvelope, RequestKind, ResponseEnvelope,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use frame::{Frame, FrameError, NetworkingMode};
pub use ids::{EventTrackingId, NodeId, RequestId};
pub use path::{Destination, NetworkPath};
pub use result::{ResultCode, RpcResult};
pub use signature::{Signature, SignatureKeyring, VerifyMode};
