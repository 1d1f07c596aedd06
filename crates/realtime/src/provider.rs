//! # Provider
//!
//! Provider defines external data interfaces for the crate.

use anyhow::Result;

use crate::feed::{ChangeStream, FeedFilter};

/// The `ChangeFeed` trait opens push subscriptions against the persistent
/// store's realtime transport.
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription scoped by `filter`. Implementations must apply the
    /// tenant filter server-side. Dropping the returned stream closes the
    /// subscription.
    fn subscribe(&self, filter: &FeedFilter) -> impl Future<Output = Result<ChangeStream>> + Send;
}

/// The `Config` trait is used by implementers to provide configuration
/// settings (typically per fleet) to dependent crates.
pub trait Config: Send + Sync {
    /// Request configuration setting.
    fn get(&self, key: &str) -> impl Future<Output = Result<String>> + Send;
}
