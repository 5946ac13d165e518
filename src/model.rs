//! Shared data types flowing through the pipeline.

use serde::{Deserialize, Serialize};

/// A single vehicle position extracted from one feed entity.
///
/// Serialized field names are part of the HTTP response and the broker
/// payload, so they must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: String,
    pub trip_id: String,
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub timestamp: u64,
}
