//! # Fleet State
//!
//! Live fleet-state reconciliation. Keeps the latest telemetry snapshot per
//! vehicle current from a change feed, classifies each vehicle as moving, idle
//! or offline, tracks recent movement trails for watched vehicles and serves
//! filtered fleet-wide counts.
//!
//! The engine is generic over a [`Provider`]: the change feed plus bulk
//! queries against the persistent store.

mod aggregate;
mod config;
mod debounce;
mod engine;
mod provider;
mod snapshot;
mod status;
mod store;
mod subscriber;
mod trail;
mod vehicle;

pub use crate::aggregate::*;
pub use crate::config::*;
pub use crate::debounce::*;
pub use crate::engine::*;
pub use crate::provider::*;
pub use crate::snapshot::*;
pub use crate::status::*;
pub use crate::store::*;
pub use crate::subscriber::*;
pub use crate::trail::*;
pub use crate::vehicle::*;
