//! Operational status classification.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Derived vehicle status. Never stored: always computed from the latest
/// snapshot and the current time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Moving,
    Idle,
    Offline,
}

impl Status {
    pub const ALL: [Self; 3] = [Self::Moving, Self::Idle, Self::Offline];
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moving => f.write_str("moving"),
            Self::Idle => f.write_str("idle"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Classifier thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Maximum silence before a vehicle is considered offline.
    pub offline_window: Duration,
    /// Speed a running vehicle must exceed to count as moving.
    pub moving_speed_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { offline_window: Duration::from_secs(15 * 60), moving_speed_threshold: 0.0 }
    }
}

/// Classifies a vehicle.
///
/// A missing snapshot, an explicit loss of connectivity, or silence longer
/// than the offline window is `Offline`. A running engine above the speed
/// threshold is `Moving`. Everything else is `Idle`.
#[must_use]
pub fn classify(
    snapshot: Option<&Snapshot>, now: DateTime<Utc>, thresholds: &Thresholds,
) -> Status {
    let Some(snapshot) = snapshot else {
        return Status::Offline;
    };

    if snapshot.is_connected == Some(false) || is_stale(snapshot, now, thresholds.offline_window) {
        return Status::Offline;
    }

    let running = snapshot.engine_on == Some(true);
    if running && snapshot.speed.is_some_and(|speed| speed > thresholds.moving_speed_threshold) {
        return Status::Moving;
    }

    Status::Idle
}

fn is_stale(snapshot: &Snapshot, now: DateTime<Utc>, window: Duration) -> bool {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(snapshot.last_communication) > window
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn snapshot(minutes_ago: i64) -> Snapshot {
        let mut snapshot = Snapshot::new("v-1", now() - chrono::Duration::minutes(minutes_ago));
        snapshot.is_connected = Some(true);
        snapshot
    }

    #[test]
    fn absent_is_offline() {
        assert_eq!(classify(None, now(), &Thresholds::default()), Status::Offline);
    }

    #[test]
    fn silent_for_twenty_minutes_is_offline() {
        let mut snap = snapshot(20);
        snap.engine_on = Some(true);
        snap.speed = Some(60.0);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Offline);
    }

    #[test]
    fn disconnected_is_offline() {
        let mut snap = snapshot(0);
        snap.is_connected = Some(false);
        snap.engine_on = Some(true);
        snap.speed = Some(60.0);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Offline);
    }

    #[test]
    fn engine_on_with_speed_is_moving() {
        let mut snap = snapshot(1);
        snap.engine_on = Some(true);
        snap.speed = Some(45.0);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Moving);
    }

    #[test]
    fn engine_on_stationary_is_idle() {
        let mut snap = snapshot(1);
        snap.engine_on = Some(true);
        snap.speed = Some(0.0);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Idle);
    }

    #[test]
    fn engine_off_is_idle() {
        let mut snap = snapshot(1);
        snap.engine_on = Some(false);
        snap.speed = Some(12.0);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Idle);
    }

    #[test]
    fn unknown_connectivity_relies_on_age() {
        let mut snap = snapshot(2);
        snap.is_connected = None;
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Idle);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let snap = snapshot(15);
        assert_eq!(classify(Some(&snap), now(), &Thresholds::default()), Status::Idle);
    }

    #[test]
    fn ageing_flips_to_offline() {
        let mut snap = snapshot(0);
        snap.engine_on = Some(true);
        snap.speed = Some(30.0);
        let thresholds = Thresholds::default();

        let first = classify(Some(&snap), now(), &thresholds);
        assert_eq!(first, classify(Some(&snap), now(), &thresholds));
        assert_eq!(first, Status::Moving);

        let later = now() + chrono::Duration::minutes(16);
        assert_eq!(classify(Some(&snap), later, &thresholds), Status::Offline);
    }

    #[test]
    fn custom_thresholds() {
        let mut snap = snapshot(30);
        snap.engine_on = Some(true);
        snap.speed = Some(1.5);
        let thresholds = Thresholds {
            offline_window: Duration::from_secs(60 * 60),
            moving_speed_threshold: 2.0,
        };
        assert_eq!(classify(Some(&snap), now(), &thresholds), Status::Idle);

        snap.speed = Some(2.5);
        assert_eq!(classify(Some(&snap), now(), &thresholds), Status::Moving);
    }
}
