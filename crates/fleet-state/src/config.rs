use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::status::Thresholds;

/// How an incoming row is ordered against the snapshot already held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyPolicy {
    /// Rows older than the stored snapshot are ignored.
    #[default]
    Monotonic,
    /// Every row is applied in arrival order. For feeds that carry manual
    /// corrections with back-dated timestamps.
    LastWriteWins,
}

impl FromStr for ApplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monotonic" => Ok(Self::Monotonic),
            "last-write-wins" | "last_write_wins" | "lww" => Ok(Self::LastWriteWins),
            other => Err(format!("unknown apply policy: {other}")),
        }
    }
}

/// What a delete event does to the stored snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Keep the last known snapshot and let it age out to offline.
    #[default]
    Retain,
    /// Remove the snapshot.
    Evict,
}

impl FromStr for DeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "evict" => Ok(Self::Evict),
            other => Err(format!("unknown delete policy: {other}")),
        }
    }
}

/// Engine configuration. Different fleets (marine, road) need different
/// thresholds, so nothing here is compiled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub offline_window: Duration,
    pub moving_speed_threshold: f64,
    pub debounce_quiet: Duration,
    pub max_pending_events: usize,
    pub poll_interval: Duration,
    pub trail_capacity: usize,
    pub trail_epsilon: f64,
    pub hydration_limit: usize,
    pub trail_history_limit: usize,
    pub apply_policy: ApplyPolicy,
    pub delete_policy: DeletePolicy,
    pub snapshot_table: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offline_window: Duration::from_secs(15 * 60),
            moving_speed_threshold: 0.0,
            debounce_quiet: Duration::from_millis(300),
            max_pending_events: 1_000,
            poll_interval: Duration::from_secs(15),
            trail_capacity: 100,
            trail_epsilon: 1e-5,
            hydration_limit: 5_000,
            trail_history_limit: 500,
            apply_policy: ApplyPolicy::Monotonic,
            delete_policy: DeletePolicy::Retain,
            snapshot_table: "vehicle_telemetry".to_string(),
        }
    }
}

impl Config {
    /// Builds configuration from process environment variables, falling back
    /// to defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds configuration from a provider's configuration source, such as
    /// per-tenant settings.
    pub async fn from_provider(provider: &impl realtime::Config) -> Self {
        let mut values = Vec::with_capacity(KEYS.len());
        for key in KEYS {
            if let Ok(value) = realtime::Config::get(provider, key).await {
                values.push((key, value));
            }
        }
        Self::from_lookup(|key| values.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let setting = Setting { lookup: &lookup };

        let config = Self {
            offline_window: setting.secs("FLEET_OFFLINE_WINDOW_SECS", defaults.offline_window),
            moving_speed_threshold: setting
                .parse("FLEET_MOVING_SPEED_THRESHOLD", defaults.moving_speed_threshold),
            debounce_quiet: setting.millis("FLEET_DEBOUNCE_MS", defaults.debounce_quiet),
            max_pending_events: setting
                .parse("FLEET_MAX_PENDING_EVENTS", defaults.max_pending_events),
            poll_interval: setting.secs("FLEET_POLL_INTERVAL_SECS", defaults.poll_interval),
            trail_capacity: setting.parse("FLEET_TRAIL_CAPACITY", defaults.trail_capacity),
            trail_epsilon: setting.parse("FLEET_TRAIL_EPSILON", defaults.trail_epsilon),
            hydration_limit: setting.parse("FLEET_HYDRATION_LIMIT", defaults.hydration_limit),
            trail_history_limit: setting
                .parse("FLEET_TRAIL_HISTORY_LIMIT", defaults.trail_history_limit),
            apply_policy: setting.parse("FLEET_APPLY_POLICY", defaults.apply_policy),
            delete_policy: setting.parse("FLEET_DELETE_POLICY", defaults.delete_policy),
            snapshot_table: lookup("FLEET_SNAPSHOT_TABLE")
                .filter(|table| !table.trim().is_empty())
                .unwrap_or(defaults.snapshot_table),
        };
        config.sanitized()
    }

    /// Classifier thresholds derived from this configuration.
    #[must_use]
    pub const fn thresholds(&self) -> Thresholds {
        Thresholds {
            offline_window: self.offline_window,
            moving_speed_threshold: self.moving_speed_threshold,
        }
    }

    // zero values would disable buffering or busy-loop the poller
    pub(crate) fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.trail_capacity == 0 {
            warn!("FLEET_TRAIL_CAPACITY must be positive; using default");
            self.trail_capacity = defaults.trail_capacity;
        }
        if self.poll_interval.is_zero() {
            warn!("FLEET_POLL_INTERVAL_SECS must be positive; using default");
            self.poll_interval = defaults.poll_interval;
        }
        if self.max_pending_events == 0 {
            self.max_pending_events = defaults.max_pending_events;
        }
        if !self.trail_epsilon.is_finite() || self.trail_epsilon < 0.0 {
            self.trail_epsilon = defaults.trail_epsilon;
        }
        self
    }
}

const KEYS: [&str; 12] = [
    "FLEET_OFFLINE_WINDOW_SECS",
    "FLEET_MOVING_SPEED_THRESHOLD",
    "FLEET_DEBOUNCE_MS",
    "FLEET_MAX_PENDING_EVENTS",
    "FLEET_POLL_INTERVAL_SECS",
    "FLEET_TRAIL_CAPACITY",
    "FLEET_TRAIL_EPSILON",
    "FLEET_HYDRATION_LIMIT",
    "FLEET_TRAIL_HISTORY_LIMIT",
    "FLEET_APPLY_POLICY",
    "FLEET_DELETE_POLICY",
    "FLEET_SNAPSHOT_TABLE",
];

struct Setting<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Setting<'_, F> {
    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        let Some(raw) = (self.lookup)(key) else {
            return default;
        };
        raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, "invalid configuration value; using default");
            default
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.parse(key, default))
    }
}
