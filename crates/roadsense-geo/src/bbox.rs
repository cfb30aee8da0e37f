//! Axis-aligned lon/lat bounding boxes for cheap pre-filtering.

use crate::geometry::Position;
use serde::{Deserialize, Serialize};

/// Kilometres per degree of latitude, rounded down so that margins derived
/// from it err on the wide side.
const KM_PER_DEGREE_LAT_MIN: f64 = 110.5;
/// Kilometres per degree of longitude at the equator.
const KM_PER_DEGREE_LON_EQUATOR: f64 = 111.33;

/// `[min_lon, min_lat, max_lon, max_lat]`, the GeoJSON `bbox` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Smallest box covering all positions, or `None` for an empty slice.
    pub fn covering(positions: &[Position]) -> Option<Self> {
        let first = positions.first()?;
        let mut bbox = Self::new(first.lon, first.lat, first.lon, first.lat);
        for p in &positions[1..] {
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lon = bbox.max_lon.max(p.lon);
            bbox.max_lat = bbox.max_lat.max(p.lat);
        }
        Some(bbox)
    }

    pub fn contains(&self, p: Position) -> bool {
        (self.min_lon..=self.max_lon).contains(&p.lon)
            && (self.min_lat..=self.max_lat).contains(&p.lat)
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Grow the box by at least `km` in every direction.
    ///
    /// The longitude margin uses the latitude closest to a pole inside the
    /// grown box. Near the poles (or across the antimeridian) the margin
    /// degenerates to the whole longitude range, which keeps the filter
    /// conservative.
    pub fn expanded_by_km(&self, km: f64) -> Self {
        let dlat = km / KM_PER_DEGREE_LAT_MIN;
        let min_lat = (self.min_lat - dlat).max(-90.0);
        let max_lat = (self.max_lat + dlat).min(90.0);

        let extreme_lat = min_lat.abs().max(max_lat.abs()).to_radians();
        let km_per_lon = KM_PER_DEGREE_LON_EQUATOR * extreme_lat.cos();
        let (min_lon, max_lon) = if km_per_lon <= 1e-6 {
            (-180.0, 180.0)
        } else {
            let dlon = km / km_per_lon;
            let lo = self.min_lon - dlon;
            let hi = self.max_lon + dlon;
            if lo < -180.0 || hi > 180.0 {
                (-180.0, 180.0)
            } else {
                (lo, hi)
            }
        };

        Self::new(min_lon, min_lat, max_lon, max_lat)
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}
