//! Filtered fleet-wide counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;
use crate::status::{Status, Thresholds, classify};
use crate::vehicle::VehicleProfile;

/// Filter predicates a view applies to the fleet. Unset predicates match
/// everything; string comparisons ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetFilter {
    pub status: Option<Status>,
    pub vehicle_type: Option<String>,
    pub fuel_type: Option<String>,
    pub ownership: Option<String>,
    pub search: Option<String>,
}

impl FleetFilter {
    #[must_use]
    pub const fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn vehicle_type(mut self, vehicle_type: impl Into<String>) -> Self {
        self.vehicle_type = Some(vehicle_type.into());
        self
    }

    #[must_use]
    pub fn fuel_type(mut self, fuel_type: impl Into<String>) -> Self {
        self.fuel_type = Some(fuel_type.into());
        self
    }

    #[must_use]
    pub fn ownership(mut self, ownership: impl Into<String>) -> Self {
        self.ownership = Some(ownership.into());
        self
    }

    #[must_use]
    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Attribute and search predicates; status is checked separately since
    /// it depends on the current time.
    fn matches_profile(&self, vehicle_id: &str, profile: Option<&VehicleProfile>) -> bool {
        let attribute = |wanted: &Option<String>, actual: fn(&VehicleProfile) -> Option<&str>| {
            let Some(wanted) = wanted.as_deref().map(str::trim).filter(|w| !w.is_empty()) else {
                return true;
            };
            profile.and_then(actual).is_some_and(|value| value.eq_ignore_ascii_case(wanted))
        };

        attribute(&self.vehicle_type, |p| p.vehicle_type.as_deref())
            && attribute(&self.fuel_type, |p| p.fuel_type.as_deref())
            && attribute(&self.ownership, |p| p.ownership.as_deref())
            && self.matches_search(vehicle_id, profile)
    }

    fn matches_search(&self, vehicle_id: &str, profile: Option<&VehicleProfile>) -> bool {
        let Some(needle) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return true;
        };
        let needle = needle.to_lowercase();
        let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);

        contains(vehicle_id)
            || profile.is_some_and(|p| p.search_fields().any(|field| contains(field)))
    }
}

/// One tracked vehicle as seen by the aggregator.
#[derive(Debug, Clone, Copy)]
pub struct FleetEntry<'a> {
    pub vehicle_id: &'a str,
    pub profile: Option<&'a VehicleProfile>,
    pub snapshot: Option<&'a Snapshot>,
}

/// A matching vehicle with its current status, as rendered by fleet tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleStatus {
    pub vehicle_id: String,
    pub status: Status,
    pub profile: Option<VehicleProfile>,
    pub snapshot: Option<Snapshot>,
}

/// Total and per-status counts over a filtered subset of the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounts {
    pub total: usize,
    pub moving: usize,
    pub idle: usize,
    pub offline: usize,
}

impl AggregateCounts {
    #[must_use]
    pub const fn by_status(&self, status: Status) -> usize {
        match status {
            Status::Moving => self.moving,
            Status::Idle => self.idle,
            Status::Offline => self.offline,
        }
    }

    fn add(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Moving => self.moving += 1,
            Status::Idle => self.idle += 1,
            Status::Offline => self.offline += 1,
        }
    }
}

/// Counts the entries matching `filter`. Linear in the number of entries.
pub fn aggregate<'a>(
    entries: impl IntoIterator<Item = FleetEntry<'a>>, filter: &FleetFilter, now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> AggregateCounts {
    let mut counts = AggregateCounts::default();
    for (_, status) in select(entries, filter, now, thresholds) {
        counts.add(status);
    }
    counts
}

/// The entries matching `filter` with their status, ordered by vehicle id.
pub fn matching<'a>(
    entries: impl IntoIterator<Item = FleetEntry<'a>>, filter: &FleetFilter, now: DateTime<Utc>,
    thresholds: &Thresholds,
) -> Vec<VehicleStatus> {
    let mut rows: Vec<VehicleStatus> = select(entries, filter, now, thresholds)
        .map(|(entry, status)| VehicleStatus {
            vehicle_id: entry.vehicle_id.to_string(),
            status,
            profile: entry.profile.cloned(),
            snapshot: entry.snapshot.cloned(),
        })
        .collect();
    rows.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
    rows
}

fn select<'a, 'f, I>(
    entries: I, filter: &'f FleetFilter, now: DateTime<Utc>, thresholds: &'f Thresholds,
) -> impl Iterator<Item = (FleetEntry<'a>, Status)>
where
    I: IntoIterator<Item = FleetEntry<'a>>,
{
    entries.into_iter().filter_map(move |entry| {
        if !filter.matches_profile(entry.vehicle_id, entry.profile) {
            return None;
        }
        let status = classify(entry.snapshot, now, thresholds);
        if filter.status.is_some_and(|wanted| wanted != status) {
            return None;
        }
        Some((entry, status))
    })
}
