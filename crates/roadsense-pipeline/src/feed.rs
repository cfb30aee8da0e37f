//! Read-only GeoJSON snapshots of the situation and route feeds.
//!
//! A snapshot that cannot be read or is not a FeatureCollection is fatal for
//! the cycle. Individual features that cannot be understood are skipped and
//! counted.

use crate::error::SourceError;
use chrono::{DateTime, Utc};
use roadsense_geo::{Geometry, Route, Severity, Situation, SituationAttributes};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const SITUATIONS_FEED: &str = "situations";
const ROUTES_FEED: &str = "routes";

/// Where the two feeds live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSources {
    pub situations: PathBuf,
    pub routes: PathBuf,
}

/// One consistent read of both feeds, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    situations: Vec<Situation>,
    routes: Vec<Route>,
    situation_index: HashMap<String, usize>,
    route_index: HashMap<String, usize>,
    /// Features dropped while decoding (no id, no geometry, wrong shape).
    pub skipped_situation_features: usize,
    pub skipped_route_features: usize,
}

impl FeedSnapshot {
    /// Build a snapshot from already-decoded records.
    ///
    /// A repeated id keeps the last record.
    pub fn new(situations: Vec<Situation>, routes: Vec<Route>) -> Self {
        let situations = dedupe_last(situations, |s| s.id.as_str(), SITUATIONS_FEED);
        let routes = dedupe_last(routes, |r| r.id.as_str(), ROUTES_FEED);
        let situation_index = situations
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.id.clone(), idx))
            .collect();
        let route_index = routes
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.id.clone(), idx))
            .collect();
        Self {
            situations,
            routes,
            situation_index,
            route_index,
            skipped_situation_features: 0,
            skipped_route_features: 0,
        }
    }

    pub fn load(sources: &FeedSources) -> Result<Self, SourceError> {
        let (situations, skipped_situations) = load_situations(&sources.situations)?;
        let (routes, skipped_routes) = load_routes(&sources.routes)?;
        let mut snapshot = Self::new(situations, routes);
        snapshot.skipped_situation_features = skipped_situations;
        snapshot.skipped_route_features = skipped_routes;
        tracing::debug!(
            situations = snapshot.situations.len(),
            routes = snapshot.routes.len(),
            skipped_situations,
            skipped_routes,
            "loaded feed snapshot"
        );
        Ok(snapshot)
    }

    pub fn situations(&self) -> &[Situation] {
        &self.situations
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn situation(&self, id: &str) -> Option<&Situation> {
        self.situation_index.get(id).map(|idx| &self.situations[*idx])
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.route_index.get(id).map(|idx| &self.routes[*idx])
    }
}

fn dedupe_last<T>(items: Vec<T>, id: impl Fn(&T) -> &str, feed: &str) -> Vec<T> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        if last.insert(id(item).to_string(), idx).is_some() {
            tracing::warn!(feed, id = id(item), "duplicate feature id; keeping the last one");
        }
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(idx, item)| last.get(id(item)) == Some(idx))
        .map(|(_, item)| item)
        .collect()
}

/// Decode the situations feed. Returns the situations and the skipped count.
pub fn load_situations(path: &Path) -> Result<(Vec<Situation>, usize), SourceError> {
    let features = read_features(path, SITUATIONS_FEED)?;
    Ok(decode_all(features, SITUATIONS_FEED, situation_from_feature))
}

/// Decode the routes feed. Returns the routes and the skipped count.
pub fn load_routes(path: &Path) -> Result<(Vec<Route>, usize), SourceError> {
    let features = read_features(path, ROUTES_FEED)?;
    Ok(decode_all(features, ROUTES_FEED, route_from_feature))
}

fn decode_all<T>(
    features: Vec<Value>,
    feed: &'static str,
    decode: impl Fn(&Value) -> Result<T, String>,
) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(features.len());
    let mut skipped = 0;
    for (idx, feature) in features.iter().enumerate() {
        match decode(feature) {
            Ok(item) => decoded.push(item),
            Err(reason) => {
                skipped += 1;
                tracing::warn!(feed, feature = idx, %reason, "skipping malformed feature");
            }
        }
    }
    (decoded, skipped)
}

fn read_features(path: &Path, feed: &'static str) -> Result<Vec<Value>, SourceError> {
    let unavailable = |message: String| SourceError::Unavailable {
        feed,
        path: path.to_path_buf(),
        message,
    };
    let bytes = fs::read(path).map_err(|e| unavailable(e.to_string()))?;
    let root: Value = serde_json::from_slice(&bytes).map_err(|e| unavailable(e.to_string()))?;
    let is_collection = root.get("type").and_then(Value::as_str) == Some("FeatureCollection");
    match root.get("features") {
        Some(Value::Array(features)) if is_collection => Ok(features.clone()),
        _ => Err(SourceError::NotFeatureCollection {
            feed,
            path: path.to_path_buf(),
        }),
    }
}

/// Decode one situation feature.
///
/// The id comes from `properties.situation_id`, falling back to the feature `id`.
pub fn situation_from_feature(feature: &Value) -> Result<Situation, String> {
    let empty = Map::new();
    let props = properties(feature).unwrap_or(&empty);
    let id = feature_id(props, "situation_id", feature).ok_or("missing situation id")?;
    let geometry = match feature.get("geometry") {
        Some(Value::Null) | None => return Err(format!("situation {id} has no geometry")),
        Some(value) => Geometry::from_geojson(value),
    };

    let attributes = SituationAttributes {
        severity: text(props, "severity")
            .map(|raw| Severity::parse(&raw))
            .unwrap_or_default(),
        situation_type: text(props, "situation_type").unwrap_or_default(),
        comment: text(props, "comment").unwrap_or_default(),
        name: text(props, "name").unwrap_or_default(),
        region: text(props, "region").unwrap_or_default(),
        filter_used: text(props, "filter_used").unwrap_or_default(),
    };
    let updated_at = text(props, "updated_at").and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| tracing::warn!(situation_id = %id, %e, "ignoring unparseable updated_at"))
            .ok()
    });

    let mut situation = Situation::new(id, geometry).with_attributes(attributes);
    situation.updated_at = updated_at;
    Ok(situation)
}

/// Decode one route feature. Only LineString geometry is accepted.
pub fn route_from_feature(feature: &Value) -> Result<Route, String> {
    let empty = Map::new();
    let props = properties(feature).unwrap_or(&empty);
    let id = feature_id(props, "route_id", feature).ok_or("missing route id")?;
    let name = text(props, "name").unwrap_or_default();
    match feature.get("geometry").map(Geometry::from_geojson) {
        Some(Geometry::LineString(path)) => Ok(Route::new(id, name, path)),
        Some(Geometry::Invalid(err)) => Err(format!("route {id}: {err}")),
        Some(other) => Err(format!(
            "route {id} has {} geometry; LineString required",
            other.kind()
        )),
        None => Err(format!("route {id} has no geometry")),
    }
}

fn properties(feature: &Value) -> Option<&Map<String, Value>> {
    feature.get("properties").and_then(Value::as_object)
}

fn feature_id(props: &Map<String, Value>, key: &str, feature: &Value) -> Option<String> {
    props
        .get(key)
        .and_then(scalar_text)
        .or_else(|| feature.get("id").and_then(scalar_text))
        .filter(|id| !id.trim().is_empty())
}

fn text(props: &Map<String, Value>, key: &str) -> Option<String> {
    props.get(key).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "roadsense-feed-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("temp dir should be created");
        root
    }

    #[test]
    fn situation_feature_decodes_attributes() {
        let feature = json!({
            "type": "Feature",
            "id": "fallback",
            "geometry": {"type": "Point", "coordinates": [18.9553, 69.6496]},
            "properties": {
                "situation_id": "NPRA_HP_123",
                "severity": "HIGH",
                "situation_type": "roadworks",
                "comment": "Lane closed",
                "filter_used": "MaintenanceWorks",
                "updated_at": "2026-03-01T12:00:00Z"
            }
        });
        let situation = situation_from_feature(&feature).expect("decode");
        assert_eq!(situation.id, "NPRA_HP_123");
        assert_eq!(situation.attributes.severity, Severity::High);
        assert_eq!(situation.attributes.filter_used, "MaintenanceWorks");
        assert!(situation.updated_at.is_some());
        assert!(matches!(situation.geometry, Geometry::Point(_)));
    }

    #[test]
    fn feature_id_falls_back_to_feature_id() {
        let feature = json!({
            "type": "Feature",
            "id": 42,
            "geometry": {"type": "Point", "coordinates": [18.0, 69.0]},
            "properties": {}
        });
        let situation = situation_from_feature(&feature).expect("decode");
        assert_eq!(situation.id, "42");
        assert_eq!(situation.attributes.severity, Severity::Unknown);
    }

    #[test]
    fn route_requires_line_geometry() {
        let point_route = json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [18.0, 69.0]},
            "properties": {"route_id": "R1"}
        });
        assert!(route_from_feature(&point_route).is_err());

        let line_route = json!({
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[18.0, 69.0], [18.1, 69.1]]},
            "properties": {"route_id": "R1", "name": "Line 42"}
        });
        let route = route_from_feature(&line_route).expect("decode");
        assert_eq!(route.name, "Line 42");
        assert_eq!(route.path.len(), 2);
    }

    #[test]
    fn load_skips_malformed_features_and_counts_them() {
        let dir = temp_dir("load");
        let situations = dir.join("situations.geojson");
        let routes = dir.join("routes.geojson");
        fs::write(
            &situations,
            json!({
                "type": "FeatureCollection",
                "features": [
                    {"type": "Feature", "geometry": {"type": "Point", "coordinates": [18.0, 69.0]},
                     "properties": {"situation_id": "s1"}},
                    {"type": "Feature", "geometry": null, "properties": {"situation_id": "s2"}},
                    {"type": "Feature", "geometry": {"type": "Point", "coordinates": [18.0, 69.0]},
                     "properties": {}}
                ]
            })
            .to_string(),
        )
        .expect("write situations");
        fs::write(
            &routes,
            json!({
                "type": "FeatureCollection",
                "features": [
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[18.0, 69.0], [18.1, 69.0]]},
                     "properties": {"route_id": "r1"}}
                ]
            })
            .to_string(),
        )
        .expect("write routes");

        let snapshot = FeedSnapshot::load(&FeedSources { situations, routes }).expect("load");
        assert_eq!(snapshot.situations().len(), 1);
        assert_eq!(snapshot.skipped_situation_features, 2);
        assert!(snapshot.situation("s1").is_some());
        assert!(snapshot.route("r1").is_some());
    }

    #[test]
    fn missing_or_wrong_shape_feed_is_fatal() {
        let dir = temp_dir("fatal");
        let sources = FeedSources {
            situations: dir.join("missing.geojson"),
            routes: dir.join("routes.geojson"),
        };
        assert!(matches!(
            FeedSnapshot::load(&sources),
            Err(SourceError::Unavailable { feed: "situations", .. })
        ));

        let not_collection = dir.join("feature.geojson");
        fs::write(&not_collection, r#"{"type": "Feature"}"#).expect("write");
        assert!(matches!(
            load_routes(&not_collection),
            Err(SourceError::NotFeatureCollection { .. })
        ));

        let garbage = dir.join("garbage.geojson");
        fs::write(&garbage, "not json").expect("write");
        assert!(matches!(
            load_situations(&garbage),
            Err(SourceError::Unavailable { .. })
        ));
    }

    #[test]
    fn duplicate_ids_keep_the_last_record() {
        let snapshot = FeedSnapshot::new(
            vec![
                Situation::new("s1", Geometry::Point(roadsense_geo::Position::new(1.0, 1.0))),
                Situation::new("s1", Geometry::Point(roadsense_geo::Position::new(2.0, 2.0))),
            ],
            Vec::new(),
        );
        assert_eq!(snapshot.situations().len(), 1);
        let kept = snapshot.situation("s1").expect("kept");
        assert!(matches!(kept.geometry, Geometry::Point(p) if p.lon == 2.0));
    }
}
