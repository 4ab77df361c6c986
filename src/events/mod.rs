//! Node event notifications
//!
//! Pub/sub view of everything the node does. The routing core publishes
//! fire-and-forget; whoever cares (logging sinks, tests, a future UI
//! feed) subscribes.

pub mod bus;
pub mod kinds;

pub use bus::{EventBus, EventSubscriber};
pub use kinds::*;
