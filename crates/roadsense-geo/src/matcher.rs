//! Geodesic proximity matching between situation primitives and route lines.
//!
//! Distances are great-circle distances on a sphere with the mean earth
//! radius. A point is projected onto each route segment with the spherical
//! cross-track/along-track decomposition and clamped to the segment ends.
//!
//! Line primitives are matched by vertex sampling: the distance of a
//! situation line to a route is the minimum over its vertices. Segment
//! interiors of the situation line are not examined, so a situation line that
//! crosses a route between two distant vertices is not reported.

use crate::bbox::BoundingBox;
use crate::error::{GeometryError, MatchComputeError};
use crate::geometry::Position;
use crate::normalize::{LinePrimitive, NormalizedSituation, PointPrimitive, PrimitiveKind, validate_line};
use crate::situation::Route;
use geo::{Distance, Haversine};

/// Mean earth radius in kilometres (IUGG), the same radius `geo` uses.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

const NORTH_POLE: Position = Position::new(0.0, 90.0);
const SOUTH_POLE: Position = Position::new(0.0, -90.0);

/// Segments shorter than this (radians) are treated as a single vertex.
const DEGENERATE_SEGMENT_RAD: f64 = 1e-12;

/// Result of matching one situation against one route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOutcome {
    pub is_collision: bool,
    pub distance_km: f64,
    /// Situation-side position achieving the minimum distance.
    pub nearest_point: Position,
    /// Closest position on the route line.
    pub route_point: Position,
    pub source: PrimitiveKind,
}

/// A validated route polyline with its precomputed bounding box.
///
/// The box covers the great-circle arcs, not only the vertices: a long
/// east-west segment bulges poleward past both of its endpoints.
#[derive(Debug, Clone)]
pub struct RouteLine<'a> {
    route: &'a Route,
    vertices: Vec<Position>,
    bbox: BoundingBox,
}

impl<'a> RouteLine<'a> {
    pub fn new(route: &'a Route) -> Result<Self, GeometryError> {
        let vertices = validate_line(&route.path)?;
        let bbox = BoundingBox::covering(&arc_extent(&vertices)).ok_or(
            GeometryError::DegenerateLine {
                vertices: vertices.len(),
            },
        )?;
        Ok(Self {
            route,
            vertices,
            bbox,
        })
    }

    pub fn route(&self) -> &'a Route {
        self.route
    }

    pub fn id(&self) -> &'a str {
        &self.route.id
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn vertices(&self) -> &[Position] {
        &self.vertices
    }

    /// Nearest position on the polyline to `p`, with its distance in km.
    pub fn nearest_to(&self, p: Position) -> (f64, Position) {
        let mut best = (f64::INFINITY, self.vertices[0]);
        for segment in self.vertices.windows(2) {
            let candidate = nearest_on_segment(p, segment[0], segment[1]);
            // NaN never wins; the caller reports a non-finite minimum.
            if candidate.0 < best.0 {
                best = candidate;
            }
        }
        best
    }
}

/// Match every primitive of a situation against a route.
///
/// Returns `Ok(None)` when the bounding-box pre-filter rules out every
/// primitive, which is always a non-collision. When a collision exists the
/// reported distance is exact; for non-collisions it is the minimum over the
/// primitives that survived the pre-filter.
pub fn match_situation(
    situation: &NormalizedSituation<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
) -> Result<Option<MatchOutcome>, MatchComputeError> {
    check_tolerance(tolerance_km)?;
    let envelope = route.bbox.expanded_by_km(tolerance_km);

    let mut best: Option<MatchOutcome> = None;
    let candidates = situation
        .points
        .iter()
        .map(|p| match_point_in(p, route, tolerance_km, &envelope))
        .chain(
            situation
                .lines
                .iter()
                .map(|l| match_line_in(l, route, tolerance_km, &envelope)),
        );
    for candidate in candidates {
        if let Some(outcome) = candidate? {
            best = Some(match best {
                Some(current) if current.distance_km <= outcome.distance_km => current,
                _ => outcome,
            });
        }
    }
    Ok(best)
}

/// Match a single point primitive.
pub fn match_point(
    point: &PointPrimitive<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
) -> Result<Option<MatchOutcome>, MatchComputeError> {
    check_tolerance(tolerance_km)?;
    match_point_in(point, route, tolerance_km, &route.bbox.expanded_by_km(tolerance_km))
}

/// Match a single line primitive by vertex sampling.
pub fn match_line(
    line: &LinePrimitive<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
) -> Result<Option<MatchOutcome>, MatchComputeError> {
    check_tolerance(tolerance_km)?;
    match_line_in(line, route, tolerance_km, &route.bbox.expanded_by_km(tolerance_km))
}

fn match_point_in(
    point: &PointPrimitive<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
    envelope: &BoundingBox,
) -> Result<Option<MatchOutcome>, MatchComputeError> {
    if !envelope.contains(point.position) {
        return Ok(None);
    }
    let (distance_km, route_point) = route.nearest_to(point.position);
    outcome(
        point.owner.id.as_str(),
        route,
        distance_km,
        point.position,
        route_point,
        PrimitiveKind::Point,
        tolerance_km,
    )
    .map(Some)
}

fn match_line_in(
    line: &LinePrimitive<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
    envelope: &BoundingBox,
) -> Result<Option<MatchOutcome>, MatchComputeError> {
    let Some(line_bbox) = BoundingBox::covering(&line.vertices) else {
        return Ok(None);
    };
    if !line_bbox.intersects(envelope) {
        return Ok(None);
    }

    let mut best: Option<(f64, Position, Position)> = None;
    for vertex in line.vertices.iter().filter(|v| envelope.contains(**v)) {
        let (distance_km, route_point) = route.nearest_to(*vertex);
        if !distance_km.is_finite() {
            return Err(non_finite(line.owner.id.as_str(), route));
        }
        if best.is_none_or(|(d, _, _)| distance_km < d) {
            best = Some((distance_km, *vertex, route_point));
        }
    }

    match best {
        Some((distance_km, nearest_point, route_point)) => outcome(
            line.owner.id.as_str(),
            route,
            distance_km,
            nearest_point,
            route_point,
            PrimitiveKind::Line,
            tolerance_km,
        )
        .map(Some),
        None => Ok(None),
    }
}

fn outcome(
    situation_id: &str,
    route: &RouteLine<'_>,
    distance_km: f64,
    nearest_point: Position,
    route_point: Position,
    source: PrimitiveKind,
    tolerance_km: f64,
) -> Result<MatchOutcome, MatchComputeError> {
    if !distance_km.is_finite() || !route_point.lon.is_finite() || !route_point.lat.is_finite() {
        return Err(non_finite(situation_id, route));
    }
    Ok(MatchOutcome {
        is_collision: distance_km <= tolerance_km,
        distance_km,
        nearest_point,
        route_point,
        source,
    })
}

fn non_finite(situation_id: &str, route: &RouteLine<'_>) -> MatchComputeError {
    MatchComputeError::NonFinite {
        situation_id: situation_id.to_string(),
        route_id: route.id().to_string(),
    }
}

fn check_tolerance(tolerance_km: f64) -> Result<(), MatchComputeError> {
    if tolerance_km.is_finite() && tolerance_km >= 0.0 {
        Ok(())
    } else {
        Err(MatchComputeError::InvalidTolerance(tolerance_km))
    }
}

/// Vertices plus the most poleward point of every segment in each hemisphere.
///
/// The point of an arc nearest to a pole is its latitude extreme on that side.
fn arc_extent(vertices: &[Position]) -> Vec<Position> {
    let mut extent = vertices.to_vec();
    for segment in vertices.windows(2) {
        for pole in [NORTH_POLE, SOUTH_POLE] {
            let (_, apex) = nearest_on_segment(pole, segment[0], segment[1]);
            if apex.lon.is_finite() && apex.lat.is_finite() {
                extent.push(apex);
            }
        }
    }
    extent
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Position, b: Position) -> f64 {
    Haversine::distance(a.to_point(), b.to_point()) / 1000.0
}

/// Nearest point on the great-circle segment `a`-`b` to `p`.
fn nearest_on_segment(p: Position, a: Position, b: Position) -> (f64, Position) {
    let d12 = haversine_km(a, b) / EARTH_RADIUS_KM;
    if d12 < DEGENERATE_SEGMENT_RAD {
        return (haversine_km(p, a), a);
    }

    let d13 = haversine_km(a, p) / EARTH_RADIUS_KM;
    let theta12 = initial_bearing(a, b);
    let theta13 = initial_bearing(a, p);
    let delta = theta13 - theta12;

    // Behind the start of the segment.
    if delta.cos() < 0.0 {
        return (d13 * EARTH_RADIUS_KM, a);
    }

    let dxt = (d13.sin() * delta.sin()).clamp(-1.0, 1.0).asin();
    let ratio = (d13.cos() / dxt.cos()).clamp(-1.0, 1.0);
    let dat = ratio.acos();

    if dat >= d12 {
        return (haversine_km(p, b), b);
    }

    let foot = destination(a, theta12, dat);
    (haversine_km(p, foot), foot)
}

fn initial_bearing(from: Position, to: Position) -> f64 {
    let phi1 = from.lat.to_radians();
    let phi2 = to.lat.to_radians();
    let dlambda = (to.lon - from.lon).to_radians();
    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    y.atan2(x)
}

fn destination(from: Position, bearing: f64, angular_distance: f64) -> Position {
    let phi1 = from.lat.to_radians();
    let lambda1 = from.lon.to_radians();
    let (sin_d, cos_d) = angular_distance.sin_cos();
    let sin_phi2 = (phi1.sin() * cos_d + phi1.cos() * sin_d * bearing.cos()).clamp(-1.0, 1.0);
    let phi2 = sin_phi2.asin();
    let lambda2 =
        lambda1 + (bearing.sin() * sin_d * phi1.cos()).atan2(cos_d - phi1.sin() * sin_phi2);
    let lon = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;
    Position::new(lon, phi2.to_degrees())
}
