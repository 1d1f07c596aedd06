//! Vehicle register attributes.

use serde::{Deserialize, Serialize};

/// Static vehicle attributes from the fleet register. Used for filtering and
/// search; telemetry lives on [`crate::Snapshot`].
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VehicleProfile {
    pub id: String,
    pub tenant_id: Option<String>,
    pub name: Option<String>,
    pub plate_number: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub vehicle_type: Option<String>,
    pub fuel_type: Option<String>,
    pub ownership: Option<String>,
}

impl VehicleProfile {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Identifying text the free-text search runs over.
    pub fn search_fields(&self) -> impl Iterator<Item = &str> {
        [&self.name, &self.plate_number, &self.make, &self.model]
            .into_iter()
            .filter_map(|field| field.as_deref())
    }
}
