//! # Provider
//!
//! Bulk query interfaces the engine hydrates and resynchronises from. Change
//! feed subscriptions come from [`realtime::ChangeFeed`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use realtime::ChangeFeed;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::trail::TrailSample;
use crate::vehicle::VehicleProfile;

/// Latest-snapshot query. Results are ordered newest communication first
/// and capped at `limit` rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotQuery {
    pub tenant_id: String,
    pub table: String,
    pub vehicle_ids: Option<Vec<String>>,
    pub limit: usize,
}

/// Trail history query. `limit` caps the number of points across all
/// requested vehicles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailQuery {
    pub tenant_id: String,
    pub vehicle_ids: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// The `FleetQuery` trait defines the bulk reads served by the persistent
/// store.
pub trait FleetQuery: Send + Sync {
    /// Raw telemetry rows, newest first. Rows are returned untyped so they go
    /// through the same parsing and ordering guard as change events.
    fn latest_snapshots(
        &self, query: &SnapshotQuery,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Historical positions for the requested vehicles.
    fn trail_history(
        &self, query: &TrailQuery,
    ) -> impl Future<Output = Result<Vec<TrailSample>>> + Send;

    /// The tenant's vehicle register.
    fn vehicles(&self, tenant_id: &str) -> impl Future<Output = Result<Vec<VehicleProfile>>> + Send;
}

/// Everything a [`crate::FleetEngine`] needs from its environment.
pub trait Provider: ChangeFeed + FleetQuery + Clone + 'static {}

impl<T> Provider for T where T: ChangeFeed + FleetQuery + Clone + 'static {}
