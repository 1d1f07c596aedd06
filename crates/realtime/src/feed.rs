//! # Change Feed
//!
//! Row-level change notifications as delivered by the persistent store's
//! realtime transport.

use std::fmt;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream of change events for one subscription. Items are transport results:
/// an `Err` is a transient delivery failure, not the end of the stream.
pub type ChangeStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChangeEvent>> + Send>>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("INSERT"),
            Self::Update => f.write_str("UPDATE"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// A single change notification. `new` carries the row after an insert or
/// update, `old` the row before an update or delete (when the transport
/// provides it).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    #[must_use]
    pub fn insert(table: impl Into<String>, row: Value) -> Self {
        Self { kind: ChangeKind::Insert, table: table.into(), new: Some(row), old: None }
    }

    #[must_use]
    pub fn update(table: impl Into<String>, row: Value) -> Self {
        Self { kind: ChangeKind::Update, table: table.into(), new: Some(row), old: None }
    }

    #[must_use]
    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self { kind: ChangeKind::Delete, table: table.into(), new: None, old: Some(old) }
    }

    /// The row that identifies the changed entity: the new row when present,
    /// the old row otherwise.
    #[must_use]
    pub fn row(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Looks up a string (or numeric) column on the identifying row.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<String> {
        match self.row()?.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Which change kinds a subscription is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum EventKinds {
    #[default]
    All,
    Only(Vec<ChangeKind>),
}

impl EventKinds {
    #[must_use]
    pub fn contains(&self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(kinds) => kinds.contains(&kind),
        }
    }
}

/// Server-side subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedFilter {
    pub tenant_id: String,
    pub table: String,
    pub kinds: EventKinds,
}

impl FeedFilter {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self { tenant_id: tenant_id.into(), table: table.into(), kinds: EventKinds::All }
    }

    #[must_use]
    pub fn kinds(mut self, kinds: EventKinds) -> Self {
        self.kinds = kinds;
        self
    }

    /// Channel name in the form the realtime transport expects.
    #[must_use]
    pub fn channel(&self) -> String {
        format!("{}:{}:tenant_id=eq.{}", self.table, self.kinds_label(), self.tenant_id)
    }

    fn kinds_label(&self) -> String {
        match &self.kinds {
            EventKinds::All => "*".to_string(),
            EventKinds::Only(kinds) => {
                kinds.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_event() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "eventType": "UPDATE",
            "table": "vehicle_telemetry",
            "new": {"vehicle_id": "v-1", "speed": 12.5},
            "old": null
        }))
        .expect("should deserialize");

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.column("vehicle_id").as_deref(), Some("v-1"));
        assert!(event.old.is_none());
    }

    #[test]
    fn delete_uses_old_row() {
        let event = ChangeEvent::delete("vehicle_telemetry", json!({"vehicle_id": 42}));
        assert_eq!(event.column("vehicle_id").as_deref(), Some("42"));
    }

    #[test]
    fn channel_name() {
        let filter = FeedFilter::new("acme", "vehicle_telemetry");
        assert_eq!(filter.channel(), "vehicle_telemetry:*:tenant_id=eq.acme");

        let filter = filter.kinds(EventKinds::Only(vec![ChangeKind::Insert, ChangeKind::Update]));
        assert_eq!(filter.channel(), "vehicle_telemetry:INSERT,UPDATE:tenant_id=eq.acme");
        assert!(!filter.kinds.contains(ChangeKind::Delete));
    }
}
