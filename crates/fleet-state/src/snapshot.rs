//! Vehicle telemetry snapshots and the row parsing that produces them.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use realtime::{Error, Result, invalid_format, missing_field};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const TIMESTAMP_COLUMNS: [&str; 4] =
    ["last_communication", "last_communication_at", "recorded_at", "timestamp"];

// Unix values above this are treated as milliseconds (year 2286 in seconds).
const MILLIS_THRESHOLD: u64 = 10_000_000_000;

/// Latest known telemetry for one vehicle.
///
/// Telemetry fields are optional: `None` means the device never reported the
/// value, which is not the same as zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub vehicle_id: String,
    pub tenant_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub engine_on: Option<bool>,
    pub ignition: Option<bool>,
    pub fuel_level: Option<f64>,
    pub is_connected: Option<bool>,
    pub satellites: Option<i64>,
    pub signal_strength: Option<i64>,
    pub fix_type: Option<String>,
    pub last_communication: DateTime<Utc>,
}

impl Snapshot {
    #[must_use]
    pub fn new(vehicle_id: impl Into<String>, last_communication: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            tenant_id: None,
            latitude: None,
            longitude: None,
            heading: None,
            altitude: None,
            speed: None,
            engine_on: None,
            ignition: None,
            fuel_level: None,
            is_connected: None,
            satellites: None,
            signal_strength: None,
            fix_type: None,
            last_communication,
        }
    }

    /// Latitude/longitude pair, when both are known.
    #[must_use]
    pub fn position(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    /// Overlays the fields present on `patch`. Absent fields keep their
    /// current value; the communication timestamp always follows the patch.
    pub fn merge(&mut self, patch: SnapshotPatch) {
        fn set<T>(field: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *field = value;
            }
        }

        set(&mut self.tenant_id, patch.tenant_id);
        set(&mut self.latitude, patch.latitude);
        set(&mut self.longitude, patch.longitude);
        set(&mut self.heading, patch.heading);
        set(&mut self.altitude, patch.altitude);
        set(&mut self.speed, patch.speed);
        set(&mut self.engine_on, patch.engine_on);
        set(&mut self.ignition, patch.ignition);
        set(&mut self.fuel_level, patch.fuel_level);
        set(&mut self.is_connected, patch.is_connected);
        set(&mut self.satellites, patch.satellites);
        set(&mut self.signal_strength, patch.signal_strength);
        set(&mut self.fix_type, patch.fix_type);
        self.last_communication = patch.last_communication;
    }
}

impl From<SnapshotPatch> for Snapshot {
    fn from(patch: SnapshotPatch) -> Self {
        let mut snapshot = Self::new(patch.vehicle_id.clone(), patch.last_communication);
        snapshot.merge(patch);
        snapshot
    }
}

/// A telemetry row as parsed from a change event or query result.
///
/// Only the vehicle id and communication timestamp are required. Columns that
/// are absent, null or of an unexpected type are left as `None` so that one
/// damaged field never overwrites good state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPatch {
    pub vehicle_id: String,
    pub tenant_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub engine_on: Option<bool>,
    pub ignition: Option<bool>,
    pub fuel_level: Option<f64>,
    pub is_connected: Option<bool>,
    pub satellites: Option<i64>,
    pub signal_strength: Option<i64>,
    pub fix_type: Option<String>,
    pub last_communication: DateTime<Utc>,
}

impl SnapshotPatch {
    /// Parses a raw row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` when the row is not an object or the timestamp
    /// cannot be read, and `MissingField` when the vehicle id or timestamp is
    /// absent.
    pub fn from_row(row: &Value) -> Result<Self> {
        let Value::Object(columns) = row else {
            return Err(invalid_format!("row is not an object: {}", row));
        };

        let vehicle_id = identifier(columns, "vehicle_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| missing_field!("vehicle_id"))?;
        let last_communication = communication_time(columns)?;

        // a row without a usable position keeps the stored one
        let (latitude, longitude) =
            match (float(columns, "latitude"), float(columns, "longitude")) {
                (Some(lat), Some(lon)) if valid_position(lat, lon) => (Some(lat), Some(lon)),
                (None, None) => (None, None),
                (lat, lon) => {
                    tracing::debug!(%vehicle_id, ?lat, ?lon, "ignoring invalid position");
                    (None, None)
                }
            };

        Ok(Self {
            vehicle_id,
            tenant_id: identifier(columns, "tenant_id"),
            latitude,
            longitude,
            heading: float(columns, "heading"),
            altitude: float(columns, "altitude"),
            speed: float(columns, "speed").filter(|speed| *speed >= 0.0),
            engine_on: flag(columns, "engine_on"),
            ignition: flag(columns, "ignition"),
            fuel_level: float(columns, "fuel_level"),
            is_connected: flag(columns, "is_connected").or_else(|| flag(columns, "connected")),
            satellites: integer(columns, "satellites"),
            signal_strength: integer(columns, "signal_strength"),
            fix_type: identifier(columns, "fix_type"),
            last_communication,
        })
    }
}

/// Reads a timestamp in any of the forms the store emits: RFC 3339 strings,
/// Postgres text timestamps, or unix seconds/milliseconds.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(from_unix)
        }
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).and_then(from_unix),
        _ => None,
    }
}

fn from_unix(value: i64) -> Option<DateTime<Utc>> {
    if value.unsigned_abs() >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

fn communication_time(columns: &Map<String, Value>) -> Result<DateTime<Utc>> {
    let Some((name, value)) = TIMESTAMP_COLUMNS
        .iter()
        .find_map(|name| columns.get(*name).filter(|v| !v.is_null()).map(|v| (name, v)))
    else {
        return Err(missing_field!("last_communication"));
    };

    parse_timestamp(value)
        .ok_or_else(|| Error::InvalidFormat(format!("{name} is not a timestamp: {value}")))
}

fn valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}

fn identifier(columns: &Map<String, Value>, name: &str) -> Option<String> {
    match columns.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn float(columns: &Map<String, Value>, name: &str) -> Option<f64> {
    let value = match columns.get(name)? {
        Value::Number(n) => n.as_f64(),
        // numeric columns are sometimes serialized as text
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|value| value.is_finite())
}

fn integer(columns: &Map<String, Value>, name: &str) -> Option<i64> {
    match columns.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(columns: &Map<String, Value>, name: &str) -> Option<bool> {
    match columns.get(name)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Some(true),
            "false" | "f" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
