//! Node locations for hop distance annotation.
//!
//! [`LocationSource`] is the seam the reconstruction engine calls; [`StorageLocationSource`]
//! answers from `POSITION_APP` packets already in the store. Fix staleness is judged against
//! the packet time, not the wall clock: older than [`AGE_WARNING_AFTER_HOURS`] the location is
//! still used but carries a warning, older than [`MAX_LOCATION_AGE_DAYS`] it is ignored.

use chrono::{DateTime, Duration, Utc};
use log::{trace, warn};
use prost::Message;
use serde::Serialize;
use std::collections::HashMap;

use crate::node_id::format_node_id;
use crate::protobuf::meshtastic_generated as proto;
use crate::storage::Storage;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const AGE_WARNING_AFTER_HOURS: i64 = 24;
pub const MAX_LOCATION_AGE_DAYS: i64 = 7;

/// How many recent position packets to inspect for a usable fix.
const POSITION_SCAN_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    pub fix_time: DateTime<Utc>,
    pub age_warning: Option<String>,
}

impl NodeLocation {
    pub fn age_at(&self, at: DateTime<Utc>) -> Duration {
        at - self.fix_time
    }

    pub fn distance_to(&self, other: &NodeLocation) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Most recent known location of a node as of a point in time.
pub trait LocationSource {
    fn location_at(&self, node_id: u32, at: DateTime<Utc>) -> Option<NodeLocation>;
}

/// Great-circle distance in metres on a spherical earth.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixAge {
    Fresh,
    Stale(String),
    Expired,
}

pub fn age_policy(age: Duration) -> FixAge {
    if age > Duration::days(MAX_LOCATION_AGE_DAYS) {
        FixAge::Expired
    } else if age > Duration::hours(AGE_WARNING_AFTER_HOURS) {
        FixAge::Stale(format!("location is {}h old", age.num_hours()))
    } else {
        FixAge::Fresh
    }
}

/// Cross-packet memo of location lookups keyed by `(node_id, timestamp)`.
///
/// Not synchronized; share it across threads only behind a lock.
#[derive(Debug, Default)]
pub struct LocationCache {
    entries: HashMap<(u32, i64), Option<NodeLocation>>,
    hits: u64,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&mut self, source: &dyn LocationSource, node_id: u32, at: DateTime<Utc>) -> Option<NodeLocation> {
        let key = (node_id, at.timestamp_millis());
        if let Some(cached) = self.entries.get(&key) {
            self.hits += 1;
            return cached.clone();
        }
        let found = source.location_at(node_id, at);
        self.entries.insert(key, found.clone());
        found
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
    }
}

/// Location source backed by stored `POSITION_APP` packets.
#[derive(Clone)]
pub struct StorageLocationSource {
    storage: Storage,
}

impl StorageLocationSource {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

impl LocationSource for StorageLocationSource {
    fn location_at(&self, node_id: u32, at: DateTime<Utc>) -> Option<NodeLocation> {
        let records = match self.storage.recent_positions(node_id, at, POSITION_SCAN_LIMIT) {
            Ok(records) => records,
            Err(e) => {
                warn!("Position lookup for {} failed: {}", format_node_id(node_id), e);
                return None;
            }
        };

        let (record, position) = records.into_iter().find_map(|r| {
            let pos = proto::Position::decode(r.raw_payload.as_slice()).ok()?;
            match (pos.latitude_i, pos.longitude_i) {
                (Some(lat), Some(lon)) if lat != 0 || lon != 0 => Some((r, pos)),
                _ => None,
            }
        })?;

        let age_warning = match age_policy(at - record.timestamp) {
            FixAge::Fresh => None,
            FixAge::Stale(warning) => Some(warning),
            FixAge::Expired => {
                trace!(
                    "Ignoring expired fix for {} from {}",
                    format_node_id(node_id),
                    record.timestamp.to_rfc3339()
                );
                return None;
            }
        };

        Some(NodeLocation {
            latitude: position.latitude_i.unwrap_or_default() as f64 * 1e-7,
            longitude: position.longitude_i.unwrap_or_default() as f64 * 1e-7,
            altitude: position.altitude,
            fix_time: record.timestamp,
            age_warning,
        })
    }
}
