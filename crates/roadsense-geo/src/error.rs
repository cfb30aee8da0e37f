//! Error types for geometry decoding and proximity matching.

/// Malformed or unsupported situation/route geometry.
///
/// These never abort a cycle: the offending element (or the whole situation,
/// when nothing usable remains) is skipped and the error is reported as a warning.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    /// Geometry type the matcher cannot use (polygons, unknown types, ...).
    #[error("unsupported geometry type: {kind}")]
    Unsupported { kind: String },

    /// The GeoJSON object is structurally wrong.
    #[error("malformed {kind} geometry: {reason}")]
    Malformed { kind: String, reason: String },

    /// A coordinate is not finite or outside WGS84 bounds.
    #[error("invalid coordinate ({lon}, {lat})")]
    InvalidCoordinate { lon: f64, lat: f64 },

    /// A line with fewer than two usable vertices.
    #[error("line has {vertices} usable vertex(es); at least 2 required")]
    DegenerateLine { vertices: usize },
}

impl GeometryError {
    pub(crate) fn malformed(kind: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Numeric failure while computing a geodesic distance.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchComputeError {
    #[error("non-finite distance between situation {situation_id} and route {route_id}")]
    NonFinite {
        situation_id: String,
        route_id: String,
    },

    #[error("negative tolerance {0} km")]
    InvalidTolerance(f64),
}
