//! # Fleet Live
//!
//! Host for the live fleet-state engines behind an operations console. Each
//! screen mounts a scope (tenant, table and optionally a set of vehicles) and
//! reads snapshots, statuses, trails and aggregate counts from the engine
//! serving it.

mod console;
pub mod telemetry;

pub use fleet_state::*;
pub use realtime::{ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, Error, FeedFilter, Result};

pub use crate::console::*;
