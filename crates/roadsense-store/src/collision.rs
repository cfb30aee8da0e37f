//! Collision row: the one record the store owns.

use chrono::{DateTime, Utc};
use roadsense_geo::Position;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of a collision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollisionKey {
    pub situation_id: String,
    pub route_id: String,
}

impl CollisionKey {
    pub fn new(situation_id: impl Into<String>, route_id: impl Into<String>) -> Self {
        Self {
            situation_id: situation_id.into(),
            route_id: route_id.into(),
        }
    }
}

impl fmt::Display for CollisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.situation_id, self.route_id)
    }
}

/// A publish-cycle reservation on an unpublished row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub token: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Active,
    Stale,
}

/// A detected proximity match between a situation and a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    // ── Identity ──
    pub situation_id: String,
    pub route_id: String,

    // ── Geometry (refreshed by detection) ──
    pub nearest_point: Position,
    #[serde(default)]
    pub distance_km: f64,
    pub tolerance_km: f64,

    // ── Set once ──
    pub detection_timestamp: DateTime<Utc>,

    // ── Publish state (owned by the publish gate) ──
    #[serde(default)]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimLease>,
}

impl Collision {
    pub fn key(&self) -> CollisionKey {
        CollisionKey::new(self.situation_id.clone(), self.route_id.clone())
    }

    pub fn is_key(&self, key: &CollisionKey) -> bool {
        self.situation_id == key.situation_id && self.route_id == key.route_id
    }

    pub fn claim_state_at(&self, now: DateTime<Utc>) -> ClaimState {
        match &self.claim {
            None => ClaimState::Unclaimed,
            Some(lease) if lease.expires_at > now => ClaimState::Active,
            Some(_) => ClaimState::Stale,
        }
    }

    /// Tolerance in whole metres, as announced downstream.
    pub fn tolerance_meters(&self) -> u32 {
        (self.tolerance_km * 1000.0).round().max(0.0) as u32
    }
}
