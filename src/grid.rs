//! Spatial grid indexing and bucketing of vehicle records.
//!
//! Coordinates are mapped onto a fixed lattice of square cells anchored at
//! (`lat_min`, `lon_min`). Indices use floor division, so points south or
//! west of the anchor get negative indices instead of being clamped.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::VehicleRecord;

/// Vehicles grouped by grid cell, in feed order within each cell.
pub type GridBucketMap = BTreeMap<GridCellId, Vec<VehicleRecord>>;

/// Anchor point and cell size of a grid, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub lat_min: f64,
    pub lon_min: f64,
    pub cell_size: f64,
}

impl GridSpec {
    /// Grid covering the Ottawa region, roughly 11 km cells.
    pub const OTTAWA: GridSpec = GridSpec {
        lat_min: 45.0,
        lon_min: -76.0,
        cell_size: 0.1,
    };

    /// Returns the cell containing (`lat`, `lon`).
    ///
    /// Total for every input. Non-finite coordinates saturate through the
    /// float-to-int cast (NaN lands on index 0).
    pub fn cell_id(&self, lat: f64, lon: f64) -> GridCellId {
        GridCellId {
            lat_index: ((lat - self.lat_min) / self.cell_size).floor() as i64,
            lon_index: ((lon - self.lon_min) / self.cell_size).floor() as i64,
        }
    }

    /// Groups `records` by cell in a single pass.
    pub fn bucket<I>(&self, records: I) -> GridBucketMap
    where
        I: IntoIterator<Item = VehicleRecord>,
    {
        let mut buckets = GridBucketMap::new();
        for record in records {
            let cell = self.cell_id(record.latitude, record.longitude);
            buckets.entry(cell).or_default().push(record);
        }
        buckets
    }
}

impl Default for GridSpec {
    fn default() -> Self {
        Self::OTTAWA
    }
}

/// Cell id on the [`GridSpec::OTTAWA`] grid.
pub fn cell_id(lat: f64, lon: f64) -> GridCellId {
    GridSpec::OTTAWA.cell_id(lat, lon)
}

/// Buckets records on the [`GridSpec::OTTAWA`] grid.
pub fn bucket<I>(records: I) -> GridBucketMap
where
    I: IntoIterator<Item = VehicleRecord>,
{
    GridSpec::OTTAWA.bucket(records)
}

/// Discrete grid cell, written as `"<lat_index>,<lon_index>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GridCellId {
    pub lat_index: i64,
    pub lon_index: i64,
}

impl GridCellId {
    pub fn new(lat_index: i64, lon_index: i64) -> Self {
        Self {
            lat_index,
            lon_index,
        }
    }

    /// Broker topic carrying updates for this cell.
    pub fn topic(&self) -> String {
        format!("buses/grid/{self}")
    }
}

impl fmt::Display for GridCellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.lat_index, self.lon_index)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid grid cell id '{0}', expected '<lat_index>,<lon_index>'")]
pub struct ParseCellIdError(String);

impl FromStr for GridCellId {
    type Err = ParseCellIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCellIdError(s.to_string());
        let (lat, lon) = s.split_once(',').ok_or_else(err)?;
        Ok(Self {
            lat_index: lat.trim().parse().map_err(|_| err())?,
            lon_index: lon.trim().parse().map_err(|_| err())?,
        })
    }
}

impl Serialize for GridCellId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GridCellId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, lat: f64, lon: f64) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            trip_id: format!("trip-{id}"),
            route_id: "95".to_string(),
            latitude: lat,
            longitude: lon,
            speed: 0.0,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_cell_id_example_cells() {
        assert_eq!(cell_id(45.05, -75.95), GridCellId::new(0, 0));
        assert_eq!(cell_id(45.15, -75.95), GridCellId::new(1, 0));
        assert_eq!(cell_id(45.05, -75.95).to_string(), "0,0");
        assert_eq!(cell_id(45.15, -75.95).to_string(), "1,0");
    }

    #[test]
    fn test_cell_id_is_deterministic() {
        let first = cell_id(45.4215, -75.6972);
        for _ in 0..10 {
            assert_eq!(cell_id(45.4215, -75.6972), first);
        }
    }

    #[test]
    fn test_points_in_same_cell_share_id() {
        let a = cell_id(45.21, -75.71);
        let b = cell_id(45.29, -75.79);
        assert_eq!(a, b);
        assert_eq!(a, GridCellId::new(2, 2));
    }

    #[test]
    fn test_adjacent_cells_differ_in_one_component() {
        let origin = cell_id(45.25, -75.75);
        let north = cell_id(45.35, -75.75);
        let east = cell_id(45.25, -75.65);

        assert_eq!(north.lat_index, origin.lat_index + 1);
        assert_eq!(north.lon_index, origin.lon_index);
        assert_eq!(east.lat_index, origin.lat_index);
        assert_eq!(east.lon_index, origin.lon_index + 1);
    }

    #[test]
    fn test_points_before_origin_floor_to_negative() {
        // Truncation would put these in cell 0,0.
        assert_eq!(cell_id(44.95, -76.05), GridCellId::new(-1, -1));
        assert_eq!(cell_id(44.85, -75.95), GridCellId::new(-2, 0));
    }

    #[test]
    fn test_points_outside_region_are_not_clamped() {
        assert_eq!(cell_id(10.05, 10.05), GridCellId::new(-350, 860));
    }

    #[test]
    fn test_nan_does_not_panic() {
        assert_eq!(cell_id(f64::NAN, f64::NAN), GridCellId::new(0, 0));
    }

    #[test]
    fn test_custom_grid_spec() {
        let spec = GridSpec {
            lat_min: 0.0,
            lon_min: 0.0,
            cell_size: 1.0,
        };
        assert_eq!(spec.cell_id(2.5, -0.5), GridCellId::new(2, -1));
    }

    #[test]
    fn test_parse_cell_id() {
        assert_eq!("3,-2".parse::<GridCellId>(), Ok(GridCellId::new(3, -2)));
        assert!("3".parse::<GridCellId>().is_err());
        assert!("a,b".parse::<GridCellId>().is_err());
    }

    #[test]
    fn test_topic_name() {
        assert_eq!(GridCellId::new(4, -1).topic(), "buses/grid/4,-1");
    }

    #[test]
    fn test_bucket_is_partition_preserving_order() {
        let records = vec![
            record("a", 45.05, -75.95),
            record("b", 45.15, -75.95),
            record("c", 45.06, -75.94),
            record("d", 44.95, -76.05),
            record("e", 45.07, -75.93),
        ];

        let buckets = bucket(records.clone());

        let total: usize = buckets.values().map(Vec::len).sum();
        assert_eq!(total, records.len());

        for (cell, members) in &buckets {
            for r in members {
                assert_eq!(cell_id(r.latitude, r.longitude), *cell);
            }
        }

        let ids: Vec<_> = buckets[&GridCellId::new(0, 0)]
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "c", "e"]);
        assert_eq!(buckets[&GridCellId::new(1, 0)][0].id, "b");
        assert_eq!(buckets[&GridCellId::new(-1, -1)][0].id, "d");
        assert_eq!(buckets.len(), 3);
    }

    #[test]
    fn test_bucket_empty_input() {
        assert!(bucket(Vec::new()).is_empty());
    }

    #[test]
    fn test_bucket_map_serializes_with_string_keys() {
        let buckets = bucket(vec![record("a", 45.05, -75.95)]);
        let json = serde_json::to_value(&buckets).unwrap();
        assert_eq!(json["0,0"][0]["id"], "a");
        assert_eq!(json["0,0"][0]["trip_id"], "trip-a");

        let back: GridBucketMap = serde_json::from_value(json).unwrap();
        assert_eq!(back, buckets);
    }
}
