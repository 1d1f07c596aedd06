//! Bounded per-vehicle movement trails.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A single position sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub speed: Option<f64>,
}

impl TrailPoint {
    /// Whether `other` is within `epsilon` degrees of this point on both axes.
    #[must_use]
    pub fn same_position(&self, other: &Self, epsilon: f64) -> bool {
        (self.latitude - other.latitude).abs() <= epsilon
            && (self.longitude - other.longitude).abs() <= epsilon
    }
}

/// A history row for one vehicle, as returned by trail history queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailSample {
    pub vehicle_id: String,
    #[serde(flatten)]
    pub point: TrailPoint,
}

/// Result of appending a live point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailAppend {
    Appended,
    /// Appended, and the oldest point was evicted to stay within capacity.
    Evicted(TrailPoint),
    /// Within epsilon of the last point; not stored.
    Duplicate,
    /// Older than the last point; not stored.
    OutOfOrder,
}

impl TrailAppend {
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        matches!(self, Self::Appended | Self::Evicted(_))
    }
}

/// Fixed-capacity, time-ordered sequence of recent positions for one vehicle.
///
/// Length never exceeds capacity and timestamps are non-decreasing.
#[derive(Debug, Clone)]
pub struct TrailBuffer {
    points: VecDeque<TrailPoint>,
    capacity: usize,
    epsilon: f64,
}

impl TrailBuffer {
    #[must_use]
    pub fn new(capacity: usize, epsilon: f64) -> Self {
        let capacity = capacity.max(1);
        Self { points: VecDeque::with_capacity(capacity), capacity, epsilon }
    }

    /// Replaces the buffer with historical points. Input order does not
    /// matter; only the newest `capacity` distinct positions are kept.
    pub fn hydrate(&mut self, points: impl IntoIterator<Item = TrailPoint>) {
        let mut history: Vec<TrailPoint> = points.into_iter().collect();
        history.sort_by_key(|point| point.timestamp);

        self.points.clear();
        for point in history {
            self.push(point);
        }
    }

    /// Adds a live point.
    pub fn append(&mut self, point: TrailPoint) -> TrailAppend {
        if let Some(last) = self.points.back() {
            if point.timestamp < last.timestamp {
                return TrailAppend::OutOfOrder;
            }
            if last.same_position(&point, self.epsilon) {
                return TrailAppend::Duplicate;
            }
        }
        self.push(point).map_or(TrailAppend::Appended, TrailAppend::Evicted)
    }

    fn push(&mut self, point: TrailPoint) -> Option<TrailPoint> {
        if self.points.back().is_some_and(|last| last.same_position(&point, self.epsilon)) {
            return None;
        }
        self.points.push_back(point);
        if self.points.len() > self.capacity { self.points.pop_front() } else { None }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn last(&self) -> Option<&TrailPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrailPoint> {
        self.points.iter()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<TrailPoint> {
        self.points.iter().copied().collect()
    }
}

/// Trail buffers for every watched vehicle.
#[derive(Debug, Clone)]
pub struct Trails {
    buffers: HashMap<String, TrailBuffer>,
    capacity: usize,
    epsilon: f64,
}

impl Trails {
    #[must_use]
    pub fn new(capacity: usize, epsilon: f64) -> Self {
        Self { buffers: HashMap::new(), capacity, epsilon }
    }

    /// Starts tracking a vehicle's trail with an empty buffer. Returns `false`
    /// when the vehicle is already watched.
    pub fn watch(&mut self, vehicle_id: &str) -> bool {
        if self.buffers.contains_key(vehicle_id) {
            return false;
        }
        self.buffers.insert(vehicle_id.to_string(), TrailBuffer::new(self.capacity, self.epsilon));
        true
    }

    pub fn unwatch(&mut self, vehicle_id: &str) -> bool {
        self.buffers.remove(vehicle_id).is_some()
    }

    #[must_use]
    pub fn is_watched(&self, vehicle_id: &str) -> bool {
        self.buffers.contains_key(vehicle_id)
    }

    /// Bulk-loads history for one vehicle, watching it if needed.
    pub fn hydrate(&mut self, vehicle_id: &str, points: impl IntoIterator<Item = TrailPoint>) {
        self.watch(vehicle_id);
        if let Some(buffer) = self.buffers.get_mut(vehicle_id) {
            buffer.hydrate(points);
        }
    }

    /// Bulk-loads history rows spanning several vehicles. Returns the number
    /// of vehicles hydrated.
    pub fn hydrate_samples(&mut self, samples: impl IntoIterator<Item = TrailSample>) -> usize {
        let mut grouped: HashMap<String, Vec<TrailPoint>> = HashMap::new();
        for sample in samples {
            grouped.entry(sample.vehicle_id).or_default().push(sample.point);
        }
        let count = grouped.len();
        for (vehicle_id, points) in grouped {
            self.hydrate(&vehicle_id, points);
        }
        count
    }

    /// Appends a live point to a watched vehicle. Unwatched vehicles are
    /// ignored and return `None`.
    pub fn append(&mut self, vehicle_id: &str, point: TrailPoint) -> Option<TrailAppend> {
        self.buffers.get_mut(vehicle_id).map(|buffer| buffer.append(point))
    }

    #[must_use]
    pub fn get(&self, vehicle_id: &str) -> Option<&TrailBuffer> {
        self.buffers.get(vehicle_id)
    }

    /// Empties a vehicle's buffer but keeps watching it.
    pub fn clear(&mut self, vehicle_id: &str) {
        if let Some(buffer) = self.buffers.get_mut(vehicle_id) {
            buffer.clear();
        }
    }

    /// Drops every buffer.
    pub fn clear_all(&mut self) {
        self.buffers.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Great-circle distance in metres.
#[must_use]
pub fn distance_m(a: &TrailPoint, b: &TrailPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(seconds: i64, latitude: f64, longitude: f64) -> TrailPoint {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        TrailPoint {
            latitude,
            longitude,
            timestamp: base + chrono::Duration::seconds(seconds),
            speed: Some(40.0),
        }
    }

    fn assert_chronological(buffer: &TrailBuffer) {
        let points = buffer.to_vec();
        assert!(points.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn hydrate_then_live_point() {
        let mut buffer = TrailBuffer::new(100, 1e-5);
        buffer.hydrate(vec![
            at(20, -36.8500, 174.7600),
            at(0, -36.8480, 174.7630),
            at(10, -36.8490, 174.7615),
        ]);

        // ~2km north-east of the last historical point
        let live = at(30, -36.8350, 174.7750);
        assert!(distance_m(&at(20, -36.8500, 174.7600), &live) > 1_900.0);
        assert_eq!(buffer.append(live), TrailAppend::Appended);

        assert_eq!(buffer.len(), 4);
        assert_chronological(&buffer);
        assert_eq!(buffer.last(), Some(&live));
    }

    #[test]
    fn fifo_eviction() {
        let mut buffer = TrailBuffer::new(100, 1e-5);
        for i in 0..120 {
            let outcome = buffer.append(at(i, -36.0 + f64::from(i as i32) * 0.001, 174.0));
            if i < 100 {
                assert_eq!(outcome, TrailAppend::Appended);
            } else {
                let TrailAppend::Evicted(evicted) = outcome else {
                    panic!("expected eviction at append {i}");
                };
                assert_eq!(evicted.timestamp, at(i - 100, 0.0, 0.0).timestamp);
            }
        }

        assert_eq!(buffer.len(), 100);
        let first = buffer.iter().next().expect("buffer should not be empty");
        assert_eq!(first.timestamp, at(20, 0.0, 0.0).timestamp);
        assert_chronological(&buffer);
    }

    #[test]
    fn stationary_heartbeats_are_ignored() {
        let mut buffer = TrailBuffer::new(10, 1e-5);
        assert_eq!(buffer.append(at(0, -36.0, 174.0)), TrailAppend::Appended);
        assert_eq!(buffer.append(at(5, -36.000_001, 174.000_004)), TrailAppend::Duplicate);
        assert_eq!(buffer.append(at(10, -36.0, 174.0)), TrailAppend::Duplicate);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn out_of_order_point_rejected() {
        let mut buffer = TrailBuffer::new(10, 1e-5);
        buffer.append(at(10, -36.0, 174.0));
        assert_eq!(buffer.append(at(5, -36.1, 174.1)), TrailAppend::OutOfOrder);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn hydrate_is_bounded() {
        let mut buffer = TrailBuffer::new(5, 1e-5);
        buffer.hydrate((0..12).map(|i| at(i, -36.0 - f64::from(i as i32) * 0.01, 174.0)));
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.iter().next().map(|p| p.timestamp), Some(at(7, 0.0, 0.0).timestamp));
    }

    #[test]
    fn hydrate_drops_duplicates() {
        let mut buffer = TrailBuffer::new(10, 1e-5);
        buffer.hydrate(vec![at(0, -36.0, 174.0), at(1, -36.0, 174.0), at(2, -36.1, 174.0)]);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn trails_only_append_when_watched() {
        let mut trails = Trails::new(10, 1e-5);
        assert_eq!(trails.append("v-1", at(0, -36.0, 174.0)), None);

        assert!(trails.watch("v-1"));
        assert!(!trails.watch("v-1"));
        assert_eq!(trails.append("v-1", at(0, -36.0, 174.0)), Some(TrailAppend::Appended));
        assert_eq!(trails.get("v-1").map(TrailBuffer::len), Some(1));

        trails.clear("v-1");
        assert!(trails.is_watched("v-1"));
        assert_eq!(trails.get("v-1").map(TrailBuffer::len), Some(0));

        trails.clear_all();
        assert!(trails.is_empty());
    }

    #[test]
    fn hydrate_samples_groups_by_vehicle() {
        let mut trails = Trails::new(10, 1e-5);
        let samples = vec![
            TrailSample { vehicle_id: "a".to_string(), point: at(2, -36.2, 174.0) },
            TrailSample { vehicle_id: "b".to_string(), point: at(1, -37.0, 175.0) },
            TrailSample { vehicle_id: "a".to_string(), point: at(1, -36.1, 174.0) },
        ];

        assert_eq!(trails.hydrate_samples(samples), 2);
        assert_eq!(trails.get("a").map(TrailBuffer::len), Some(2));
        assert_eq!(trails.get("b").map(TrailBuffer::len), Some(1));
        assert_chronological(trails.get("a").expect("a should be watched"));
    }
}
