use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::DomainResult;
use crate::error::DomainError;

/// Flat conversion factor used for every radius comparison. Only accurate
/// near the equator; the east-west error grows with latitude.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

pub fn meters_to_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> DomainResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DomainError::Validation(
                "latitude must be between -90 and 90".into(),
            ));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DomainError::Validation(
                "longitude must be between -180 and 180".into(),
            ));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Planar distance in degrees, comparable against `meters_to_degrees(radius)`.
    pub fn degree_distance(&self, other: &GeoPoint) -> f64 {
        let d_lat = self.latitude - other.latitude;
        let d_lng = self.longitude - other.longitude;
        (d_lat * d_lat + d_lng * d_lng).sqrt()
    }

    pub fn within_meters(&self, other: &GeoPoint, radius_m: f64) -> bool {
        self.degree_distance(other) <= meters_to_degrees(radius_m)
    }
}

/// Square grid cell. With a side equal to the search radius, any two points
/// within the radius land in the same or adjacent cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpatialCell {
    pub lat_index: i64,
    pub lng_index: i64,
}

impl SpatialCell {
    pub fn containing(point: &GeoPoint, cell_size_deg: f64) -> Self {
        let size = if cell_size_deg > 0.0 {
            cell_size_deg
        } else {
            meters_to_degrees(1.0)
        };
        Self {
            lat_index: (point.latitude / size).floor() as i64,
            lng_index: (point.longitude / size).floor() as i64,
        }
    }

    pub fn neighbourhood(&self) -> Vec<SpatialCell> {
        let mut cells = Vec::with_capacity(9);
        for d_lat in -1..=1 {
            for d_lng in -1..=1 {
                cells.push(SpatialCell {
                    lat_index: self.lat_index + d_lat,
                    lng_index: self.lng_index + d_lng,
                });
            }
        }
        cells.sort();
        cells
    }

    pub fn lock_key(&self, scope: &str) -> String {
        format!("{scope}:{}:{}", self.lat_index, self.lng_index)
    }
}

type LockRegistry = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Async mutexes created on demand per string key. Entries are dropped again
/// once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    registry: LockRegistry,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks every key in sorted order so overlapping key sets cannot deadlock.
    pub async fn acquire_all(&self, keys: impl IntoIterator<Item = String>) -> KeyedLockGuard {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = {
                let mut registry = lock_registry(&self.registry);
                registry
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            };
            guards.push(lock.lock_owned().await);
        }

        KeyedLockGuard {
            keys,
            guards,
            registry: self.registry.clone(),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        lock_registry(&self.registry).len()
    }
}

pub struct KeyedLockGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    registry: LockRegistry,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut registry = lock_registry(&self.registry);
        for key in &self.keys {
            let idle = registry
                .get(key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1);
            if idle {
                registry.remove(key);
            }
        }
    }
}

fn lock_registry(
    registry: &LockRegistry,
) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
