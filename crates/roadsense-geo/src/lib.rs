//! # roadsense-geo
//!
//! Geometry layer for situation/route collision detection.
//!
//! ```text
//! GeoJSON geometry ──decode──▶ Geometry (Point | LineString | Collection | ...)
//!                                  │ normalize
//!                                  ▼
//!                  NormalizedSituation { points, lines, warnings }
//!                                  │ match_situation(route, tolerance_km)
//!                                  ▼
//!                  MatchOutcome { is_collision, distance_km, nearest_point }
//! ```
//!
//! Everything here is pure and side-effect free, so matching can be fanned
//! out across (situation, route) pairs freely.

pub mod bbox;
pub mod error;
pub mod geometry;
pub mod matcher;
pub mod normalize;
pub mod situation;

pub use bbox::BoundingBox;
pub use error::{GeometryError, MatchComputeError};
pub use geometry::{Geometry, Position};
pub use matcher::{
    EARTH_RADIUS_KM, MatchOutcome, RouteLine, haversine_km, match_line, match_point,
    match_situation,
};
pub use normalize::{
    LinePrimitive, NormalizedSituation, PointPrimitive, PrimitiveKind, normalize,
    normalize_within,
};
pub use situation::{Route, Severity, Situation, SituationAttributes};
