//! Cross-cutting primitives: cancellation, shutdown, transport errors

pub mod cancel;
pub mod errors;
pub mod shutdown;

pub use cancel::CancelToken;
pub use errors::{NodeError, SendError};
pub use shutdown::ShutdownSignal;
