//! Raw situation/route geometry and its GeoJSON decoding.
//!
//! Decoding is structural only. Coordinate range checks happen during
//! normalization so that one bad member of a collection does not take its
//! siblings down with it.

use crate::error::GeometryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A WGS84 position, longitude first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Whether both components are finite and inside WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }

    pub fn validated(self) -> Result<Self, GeometryError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GeometryError::InvalidCoordinate {
                lon: self.lon,
                lat: self.lat,
            })
        }
    }

    pub(crate) fn to_point(self) -> geo::Point<f64> {
        geo::Point::new(self.lon, self.lat)
    }
}

/// Situation geometry as delivered by the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
    /// Mixed members; nested collections are allowed.
    Collection(Vec<Geometry>),
    /// A well-formed geometry of a type the matcher does not handle.
    Unsupported { kind: String },
    /// A member that could not be decoded at all.
    Invalid(GeometryError),
}

impl Geometry {
    /// Decode a GeoJSON geometry object.
    ///
    /// Never fails: structural problems are captured as `Geometry::Invalid`
    /// and surface as warnings during normalization.
    pub fn from_geojson(value: &Value) -> Self {
        match decode(value) {
            Ok(geometry) => geometry,
            Err(err) => Self::Invalid(err),
        }
    }

    /// GeoJSON type name of this geometry.
    pub fn kind(&self) -> &str {
        match self {
            Self::Point(_) => "Point",
            Self::LineString(_) => "LineString",
            Self::Collection(_) => "GeometryCollection",
            Self::Unsupported { kind } => kind.as_str(),
            Self::Invalid(_) => "Invalid",
        }
    }
}

fn decode(value: &Value) -> Result<Geometry, GeometryError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GeometryError::malformed("unknown", "missing `type`"))?;

    match kind {
        "Point" => Ok(Geometry::Point(position(coordinates(value, kind)?, kind)?)),
        "LineString" => Ok(Geometry::LineString(positions(
            coordinates(value, kind)?,
            kind,
        )?)),
        "MultiPoint" => {
            let members = positions(coordinates(value, kind)?, kind)?;
            Ok(Geometry::Collection(
                members.into_iter().map(Geometry::Point).collect(),
            ))
        }
        "MultiLineString" => {
            let lines = coordinates(value, kind)?
                .as_array()
                .ok_or_else(|| GeometryError::malformed(kind, "coordinates must be an array"))?;
            let members = lines
                .iter()
                .map(|line| match positions(line, kind) {
                    Ok(vertices) => Geometry::LineString(vertices),
                    Err(err) => Geometry::Invalid(err),
                })
                .collect();
            Ok(Geometry::Collection(members))
        }
        "GeometryCollection" => {
            let members = value
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| GeometryError::malformed(kind, "missing `geometries` array"))?;
            Ok(Geometry::Collection(
                members.iter().map(Geometry::from_geojson).collect(),
            ))
        }
        other => Ok(Geometry::Unsupported {
            kind: other.to_string(),
        }),
    }
}

fn coordinates<'a>(value: &'a Value, kind: &str) -> Result<&'a Value, GeometryError> {
    value
        .get("coordinates")
        .ok_or_else(|| GeometryError::malformed(kind, "missing `coordinates`"))
}

fn position(value: &Value, kind: &str) -> Result<Position, GeometryError> {
    let pair = value
        .as_array()
        .ok_or_else(|| GeometryError::malformed(kind, "position must be an array"))?;
    if pair.len() < 2 {
        return Err(GeometryError::malformed(
            kind,
            format!("position has {} component(s)", pair.len()),
        ));
    }
    let lon = pair[0]
        .as_f64()
        .ok_or_else(|| GeometryError::malformed(kind, "longitude is not a number"))?;
    let lat = pair[1]
        .as_f64()
        .ok_or_else(|| GeometryError::malformed(kind, "latitude is not a number"))?;
    Ok(Position::new(lon, lat))
}

fn positions(value: &Value, kind: &str) -> Result<Vec<Position>, GeometryError> {
    value
        .as_array()
        .ok_or_else(|| GeometryError::malformed(kind, "coordinates must be an array"))?
        .iter()
        .map(|item| position(item, kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_point_and_line() {
        let point = Geometry::from_geojson(&json!({
            "type": "Point",
            "coordinates": [18.9553, 69.6496]
        }));
        assert_eq!(point, Geometry::Point(Position::new(18.9553, 69.6496)));

        let line = Geometry::from_geojson(&json!({
            "type": "LineString",
            "coordinates": [[18.0, 69.0], [18.1, 69.1, 12.0]]
        }));
        assert_eq!(
            line,
            Geometry::LineString(vec![Position::new(18.0, 69.0), Position::new(18.1, 69.1)])
        );
    }

    #[test]
    fn multi_geometries_become_collections() {
        let multi = Geometry::from_geojson(&json!({
            "type": "MultiPoint",
            "coordinates": [[1.0, 2.0], [3.0, 4.0]]
        }));
        assert_eq!(
            multi,
            Geometry::Collection(vec![
                Geometry::Point(Position::new(1.0, 2.0)),
                Geometry::Point(Position::new(3.0, 4.0)),
            ])
        );
    }

    #[test]
    fn bad_collection_member_does_not_poison_siblings() {
        let collection = Geometry::from_geojson(&json!({
            "type": "GeometryCollection",
            "geometries": [
                {"type": "Point", "coordinates": ["x", 1.0]},
                {"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]]]},
                {"type": "Point", "coordinates": [5.0, 60.0]}
            ]
        }));
        let Geometry::Collection(members) = collection else {
            panic!("expected collection");
        };
        assert!(matches!(members[0], Geometry::Invalid(GeometryError::Malformed { .. })));
        assert_eq!(
            members[1],
            Geometry::Unsupported {
                kind: "Polygon".to_string()
            }
        );
        assert_eq!(members[2], Geometry::Point(Position::new(5.0, 60.0)));
    }

    #[test]
    fn missing_type_is_invalid() {
        let geometry = Geometry::from_geojson(&json!({"coordinates": [1.0, 2.0]}));
        assert!(matches!(geometry, Geometry::Invalid(_)));
    }

    #[test]
    fn position_validation_rejects_out_of_range() {
        assert!(Position::new(181.0, 0.0).validated().is_err());
        assert!(Position::new(0.0, f64::NAN).validated().is_err());
        assert!(Position::new(-180.0, 90.0).validated().is_ok());
    }
}
