//! Subscription machinery: the reverse indexes and the per-subscription
//! worker registry.

pub mod index;
pub mod registry;

pub use index::SubscriptionIndex;
pub use registry::{SubscriptionRegistry, SubscriptionSpec, Transport};

/// Opaque subscription identifier handed to the indexes and the broadcaster;
/// only the registry resolves it back to a worker.
pub type SubscriptionId = String;
