//! Flattening of situation geometry into point and line primitives.
//!
//! All shape-specific branching lives here; the matcher only ever sees
//! points and polylines.

use crate::bbox::BoundingBox;
use crate::error::GeometryError;
use crate::geometry::{Geometry, Position};
use crate::situation::{Situation, SituationAttributes};

/// Which kind of primitive produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Point,
    Line,
}

#[derive(Debug, Clone, Copy)]
pub struct PointPrimitive<'a> {
    pub owner: &'a Situation,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct LinePrimitive<'a> {
    pub owner: &'a Situation,
    pub vertices: Vec<Position>,
}

/// The canonical point/line decomposition of one situation.
#[derive(Debug, Clone)]
pub struct NormalizedSituation<'a> {
    pub situation: &'a Situation,
    pub points: Vec<PointPrimitive<'a>>,
    pub lines: Vec<LinePrimitive<'a>>,
    pub warnings: Vec<GeometryError>,
    /// Primitives dropped because they lie outside the area of interest.
    pub outside_area: usize,
}

impl<'a> NormalizedSituation<'a> {
    pub fn id(&self) -> &'a str {
        &self.situation.id
    }

    pub fn attributes(&self) -> &'a SituationAttributes {
        &self.situation.attributes
    }

    /// A situation without primitives takes no part in matching.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.lines.is_empty()
    }

    pub fn primitive_count(&self) -> usize {
        self.points.len() + self.lines.len()
    }
}

/// Normalize a situation's geometry.
pub fn normalize(situation: &Situation) -> NormalizedSituation<'_> {
    normalize_within(situation, None)
}

/// Normalize, dropping primitives that lie entirely outside `area`.
///
/// A line with at least one vertex inside the area is kept whole.
pub fn normalize_within<'a>(
    situation: &'a Situation,
    area: Option<&BoundingBox>,
) -> NormalizedSituation<'a> {
    let mut out = NormalizedSituation {
        situation,
        points: Vec::new(),
        lines: Vec::new(),
        warnings: Vec::new(),
        outside_area: 0,
    };
    collect(&situation.geometry, area, &mut out);

    for warning in &out.warnings {
        tracing::warn!(situation_id = %situation.id, %warning, "skipping situation geometry member");
    }
    out
}

fn collect<'a>(geometry: &Geometry, area: Option<&BoundingBox>, out: &mut NormalizedSituation<'a>) {
    match geometry {
        Geometry::Point(position) => match position.validated() {
            Ok(position) => {
                if area.is_some_and(|bbox| !bbox.contains(position)) {
                    out.outside_area += 1;
                } else {
                    out.points.push(PointPrimitive {
                        owner: out.situation,
                        position,
                    });
                }
            }
            Err(err) => out.warnings.push(err),
        },
        Geometry::LineString(vertices) => match validate_line(vertices) {
            Ok(vertices) => {
                if area.is_some_and(|bbox| !vertices.iter().any(|v| bbox.contains(*v))) {
                    out.outside_area += 1;
                } else {
                    out.lines.push(LinePrimitive {
                        owner: out.situation,
                        vertices,
                    });
                }
            }
            Err(err) => out.warnings.push(err),
        },
        Geometry::Collection(members) => {
            for member in members {
                collect(member, area, out);
            }
        }
        Geometry::Unsupported { kind } => out
            .warnings
            .push(GeometryError::Unsupported { kind: kind.clone() }),
        Geometry::Invalid(err) => out.warnings.push(err.clone()),
    }
}

/// Check every vertex and require at least two of them.
pub(crate) fn validate_line(vertices: &[Position]) -> Result<Vec<Position>, GeometryError> {
    let vertices = vertices
        .iter()
        .map(|v| v.validated())
        .collect::<Result<Vec<_>, _>>()?;
    if vertices.len() < 2 {
        return Err(GeometryError::DegenerateLine {
            vertices: vertices.len(),
        });
    }
    Ok(vertices)
}
