//! Outbound "new collision" announcements: topic and JSON payload.

use chrono::SecondsFormat;
use roadsense_geo::{Route, Severity, Situation};
use roadsense_store::Collision;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const NEW_COLLISION_EVENT: &str = "new_collision";
pub const UNKNOWN_SEGMENT: &str = "_unknown_";
const MESSAGE_ID_PREFIX: &str = "col1_";

/// Make a value safe as a single topic level.
///
/// Wildcards and the level separator become `_`; empty values become
/// `_unknown_`.
pub fn sanitize_topic_segment(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return UNKNOWN_SEGMENT.to_string();
    }
    trimmed
        .chars()
        .map(|c| match c {
            '+' | '#' | '/' => '_',
            other => other,
        })
        .collect()
}

/// `{base}/route/{route_id}/severity/{severity}/filter/{filter_used}`.
///
/// The base topic is used as configured (it may span several levels); only
/// trailing separators are trimmed.
pub fn collision_topic(base_topic: &str, route_id: &str, severity: Severity, filter_used: &str) -> String {
    format!(
        "{}/route/{}/severity/{}/filter/{}",
        base_topic.trim_end_matches('/'),
        sanitize_topic_segment(route_id),
        severity.as_str(),
        sanitize_topic_segment(filter_used),
    )
}

/// Stable identifier for one collision announcement.
///
/// Retries of the same row produce the same id, so consumers can dedupe.
pub fn message_id(collision: &Collision) -> String {
    let timestamp = format_timestamp(collision);
    let mut hasher = Sha256::new();
    for part in [
        collision.situation_id.as_str(),
        collision.route_id.as_str(),
        timestamp.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{MESSAGE_ID_PREFIX}{:x}", hasher.finalize())
}

fn format_timestamp(collision: &Collision) -> String {
    collision
        .detection_timestamp
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionPayload {
    pub event: String,
    pub message_id: String,
    pub situation_id: String,
    pub route_id: String,
    pub route_name: String,
    pub lat: f64,
    pub lon: f64,
    pub detection_timestamp: String,
    pub tolerance_meters: u32,
    pub distance_meters: u32,
    pub severity: Severity,
    pub filter_used: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: CollisionPayload,
}

impl OutboundMessage {
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload)
    }
}

/// Build the announcement for a stored collision.
///
/// Situation attributes come from the current snapshot. A situation that is
/// no longer in the feed announces severity `unknown` and filter `_unknown_`.
pub fn build_message(
    base_topic: &str,
    collision: &Collision,
    situation: Option<&Situation>,
    route: Option<&Route>,
) -> OutboundMessage {
    let (severity, filter_used, comment) = match situation {
        Some(situation) => (
            situation.attributes.severity,
            situation.attributes.filter_used.as_str(),
            situation.attributes.comment.as_str(),
        ),
        None => (Severity::Unknown, "", ""),
    };
    let filter_used = sanitize_topic_segment(filter_used);

    OutboundMessage {
        topic: collision_topic(base_topic, &collision.route_id, severity, &filter_used),
        payload: CollisionPayload {
            event: NEW_COLLISION_EVENT.to_string(),
            message_id: message_id(collision),
            situation_id: collision.situation_id.clone(),
            route_id: collision.route_id.clone(),
            route_name: route.map(|r| r.name.clone()).unwrap_or_default(),
            lat: collision.nearest_point.lat,
            lon: collision.nearest_point.lon,
            detection_timestamp: format_timestamp(collision),
            tolerance_meters: collision.tolerance_meters(),
            distance_meters: (collision.distance_km * 1000.0).round().max(0.0) as u32,
            severity,
            filter_used,
            comment: comment.to_string(),
        },
    }
}
