//! Protobuf decoding of GTFS Realtime vehicle-position feeds.

use prost::Message;

use crate::error::DecodeError;
use crate::gtfs_rt::{FeedMessage, VehiclePosition};
use crate::model::VehicleRecord;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, DecodeError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Decodes raw feed bytes straight into vehicle records.
///
/// # Errors
///
/// Returns [`DecodeError`] when the bytes are not a well-formed feed message.
pub fn decode_vehicles(bytes: &[u8]) -> Result<Vec<VehicleRecord>, DecodeError> {
    let feed = parse_feed(bytes)?;
    Ok(vehicles_from_feed(&feed))
}

/// Extracts one record per entity carrying a vehicle position, in entity
/// order. Entities without a vehicle are skipped.
pub fn vehicles_from_feed(feed: &FeedMessage) -> Vec<VehicleRecord> {
    feed.entity
        .iter()
        .filter_map(|e| e.vehicle.as_ref())
        .map(vehicle_record)
        .collect()
}

// Absent optional fields fall back to their protobuf defaults.
fn vehicle_record(v: &VehiclePosition) -> VehicleRecord {
    let trip = v.trip.as_ref();
    let position = v.position.as_ref();

    VehicleRecord {
        id: v
            .vehicle
            .as_ref()
            .and_then(|d| d.id.clone())
            .unwrap_or_default(),
        trip_id: trip.and_then(|t| t.trip_id.clone()).unwrap_or_default(),
        route_id: trip.and_then(|t| t.route_id.clone()).unwrap_or_default(),
        latitude: position.map_or(0.0, |p| f64::from(p.latitude)),
        longitude: position.map_or(0.0, |p| f64::from(p.longitude)),
        speed: position
            .and_then(|p| p.speed)
            .map_or(0.0, f64::from),
        timestamp: v.timestamp.unwrap_or_default(),
    }
}
