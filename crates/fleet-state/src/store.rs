//! Latest-state store: one snapshot per vehicle, newest wins.

use std::collections::{HashMap, HashSet};

use realtime::{ChangeEvent, ChangeKind, Result, missing_field};
use serde_json::Value;

use crate::config::{ApplyPolicy, DeletePolicy};
use crate::snapshot::{Snapshot, SnapshotPatch};

/// What applying a row did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First snapshot for the vehicle.
    Inserted,
    /// The stored snapshot was superseded.
    Updated,
    /// The row was older than the stored snapshot and was ignored.
    Outdated,
    /// Delete event; the last known snapshot was kept.
    Retained,
    /// Delete event; the snapshot was removed.
    Evicted,
}

impl ApplyOutcome {
    /// Whether the store contents changed.
    #[must_use]
    pub const fn is_change(&self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Evicted)
    }
}

/// Summary of a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hydration {
    pub applied: usize,
    pub outdated: usize,
    pub rejected: usize,
}

/// In-memory map from vehicle id to its most recent snapshot.
#[derive(Debug, Clone, Default)]
pub struct LatestStateStore {
    snapshots: HashMap<String, Snapshot>,
    apply_policy: ApplyPolicy,
    delete_policy: DeletePolicy,
}

impl LatestStateStore {
    #[must_use]
    pub fn new(apply_policy: ApplyPolicy, delete_policy: DeletePolicy) -> Self {
        Self { snapshots: HashMap::new(), apply_policy, delete_policy }
    }

    /// Bulk-loads rows from a hydration or poll query.
    ///
    /// Rows are applied in order through the same guard as live events, so
    /// for a vehicle with several rows the newest survives and, on equal
    /// timestamps, the first one seen. Unreadable rows are skipped and counted.
    pub fn hydrate<'a>(&mut self, rows: impl IntoIterator<Item = &'a Value>) -> Hydration {
        let mut summary = Hydration::default();
        let mut seen = HashSet::new();

        for row in rows {
            let patch = match SnapshotPatch::from_row(row) {
                Ok(patch) => patch,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping hydration row");
                    summary.rejected += 1;
                    continue;
                }
            };

            // first seen wins on ties within one batch
            let duplicate_tie = seen.contains(&patch.vehicle_id)
                && self
                    .snapshots
                    .get(&patch.vehicle_id)
                    .is_some_and(|current| current.last_communication == patch.last_communication);
            if duplicate_tie {
                summary.outdated += 1;
                continue;
            }
            seen.insert(patch.vehicle_id.clone());

            match self.upsert(patch, ApplyPolicy::Monotonic) {
                ApplyOutcome::Outdated => summary.outdated += 1,
                _ => summary.applied += 1,
            }
        }
        summary
    }

    /// Applies one change event.
    ///
    /// # Errors
    ///
    /// Returns an error when the event carries no row or the row cannot be
    /// interpreted. The store is left untouched in that case.
    pub fn apply(&mut self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let row = event.new.as_ref().ok_or_else(|| missing_field!("new row"))?;
                let patch = SnapshotPatch::from_row(row)?;
                Ok(self.upsert(patch, self.apply_policy))
            }
            ChangeKind::Delete => {
                let vehicle_id =
                    event.column("vehicle_id").ok_or_else(|| missing_field!("vehicle_id"))?;
                match self.delete_policy {
                    DeletePolicy::Retain => Ok(ApplyOutcome::Retained),
                    DeletePolicy::Evict => {
                        if self.snapshots.remove(&vehicle_id).is_some() {
                            Ok(ApplyOutcome::Evicted)
                        } else {
                            Ok(ApplyOutcome::Retained)
                        }
                    }
                }
            }
        }
    }

    /// Applies a parsed row.
    pub fn upsert(&mut self, patch: SnapshotPatch, policy: ApplyPolicy) -> ApplyOutcome {
        let Some(current) = self.snapshots.get_mut(&patch.vehicle_id) else {
            self.snapshots.insert(patch.vehicle_id.clone(), Snapshot::from(patch));
            return ApplyOutcome::Inserted;
        };

        if policy == ApplyPolicy::Monotonic && patch.last_communication < current.last_communication
        {
            return ApplyOutcome::Outdated;
        }

        current.merge(patch);
        ApplyOutcome::Updated
    }

    #[must_use]
    pub fn get(&self, vehicle_id: &str) -> Option<&Snapshot> {
        self.snapshots.get(vehicle_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.snapshots.keys().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, vehicle_id: &str) -> bool {
        self.snapshots.contains_key(vehicle_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}
