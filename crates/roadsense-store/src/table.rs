//! Canonical in-memory representation of the collision table.
//!
//! All state transitions live here and take an explicit `now`, so the JSONL
//! store only has to wrap them in a lock scope.

use crate::claim::{ClaimOutcome, ClaimTicket, new_claim_token};
use crate::collision::{ClaimLease, ClaimState, Collision, CollisionKey};
use crate::jsonl::{JsonlError, read_collisions_from_path, write_collisions_to_path};
use chrono::{DateTime, Duration, Utc};
use roadsense_geo::Position;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Errors raised while loading, mutating, or persisting collisions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollisionStoreError {
    #[error(transparent)]
    Jsonl(#[from] JsonlError),

    #[error("collision lock busy: {lock_path}")]
    LockBusy { lock_path: String },

    #[error("failed to acquire collision lock {lock_path}: {message}")]
    LockIo { lock_path: String, message: String },

    #[error("collision not found: {0}")]
    NotFound(CollisionKey),

    #[error("invalid collision record for {key}: {reason}")]
    InvalidRecord { key: CollisionKey, reason: String },

    #[error("claim on {0} is no longer held")]
    ClaimLost(CollisionKey),
}

/// Detection result to be written for one (situation, route) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub key: CollisionKey,
    pub nearest_point: Position,
    pub distance_km: f64,
    pub tolerance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertChange {
    Created,
    Refreshed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub collision: Collision,
    pub change: UpsertChange,
}

#[derive(Debug, Clone, Default)]
pub struct CollisionTable {
    rows: BTreeMap<CollisionKey, Collision>,
}

impl CollisionTable {
    /// Build a table from stored rows.
    ///
    /// A duplicated key keeps the last row, matching append-style JSONL edits.
    pub fn from_collisions(collisions: Vec<Collision>) -> Self {
        let mut rows = BTreeMap::new();
        for collision in collisions {
            if let Some(previous) = rows.insert(collision.key(), collision) {
                tracing::warn!(key = %previous.key(), "duplicate collision row; keeping the last one");
            }
        }
        Self { rows }
    }

    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Self, CollisionStoreError> {
        Ok(Self::from_collisions(read_collisions_from_path(path)?))
    }

    pub fn save_jsonl(&self, path: impl AsRef<Path>) -> Result<(), CollisionStoreError> {
        let rows: Vec<Collision> = self.rows.values().cloned().collect();
        write_collisions_to_path(path, &rows)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &CollisionKey) -> Option<&Collision> {
        self.rows.get(key)
    }

    /// All rows in deterministic (situation_id, route_id) order.
    pub fn collisions(&self) -> impl Iterator<Item = &Collision> {
        self.rows.values()
    }

    /// Unpublished rows, oldest detection first.
    pub fn unpublished(&self) -> Vec<&Collision> {
        let mut rows: Vec<&Collision> = self.rows.values().filter(|c| !c.published).collect();
        rows.sort_by(|a, b| {
            a.detection_timestamp
                .cmp(&b.detection_timestamp)
                .then_with(|| a.situation_id.cmp(&b.situation_id))
                .then_with(|| a.route_id.cmp(&b.route_id))
        });
        rows
    }

    /// Insert a new row or refresh the geometry of an existing one.
    ///
    /// Refresh touches `nearest_point`, `distance_km`, and `tolerance_km`
    /// only. Detection timestamp, publish state, and claims are preserved.
    pub fn upsert(
        &mut self,
        request: &UpsertRequest,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, CollisionStoreError> {
        validate_request(request)?;

        if let Some(existing) = self.rows.get_mut(&request.key) {
            let unchanged = existing.nearest_point == request.nearest_point
                && existing.distance_km == request.distance_km
                && existing.tolerance_km == request.tolerance_km;
            if unchanged {
                return Ok(UpsertOutcome {
                    collision: existing.clone(),
                    change: UpsertChange::Unchanged,
                });
            }
            existing.nearest_point = request.nearest_point;
            existing.distance_km = request.distance_km;
            existing.tolerance_km = request.tolerance_km;
            return Ok(UpsertOutcome {
                collision: existing.clone(),
                change: UpsertChange::Refreshed,
            });
        }

        let collision = Collision {
            situation_id: request.key.situation_id.clone(),
            route_id: request.key.route_id.clone(),
            nearest_point: request.nearest_point,
            distance_km: request.distance_km,
            tolerance_km: request.tolerance_km,
            detection_timestamp: now,
            published: false,
            published_at: None,
            claim: None,
        };
        self.rows.insert(request.key.clone(), collision.clone());
        Ok(UpsertOutcome {
            collision,
            change: UpsertChange::Created,
        })
    }

    /// Compare-and-set claim on an unpublished row.
    ///
    /// A stale lease left by a dead cycle is taken over.
    pub fn claim(&mut self, key: &CollisionKey, now: DateTime<Utc>, ttl: Duration) -> ClaimOutcome {
        let Some(row) = self.rows.get_mut(key) else {
            return ClaimOutcome::NotFound;
        };
        if row.published {
            return ClaimOutcome::AlreadyPublished;
        }
        if let (ClaimState::Active, Some(lease)) = (row.claim_state_at(now), row.claim.as_ref()) {
            return ClaimOutcome::Held {
                expires_at: lease.expires_at,
            };
        }

        let lease = ClaimLease {
            token: new_claim_token(),
            claimed_at: now,
            expires_at: now + ttl,
        };
        let ticket = ClaimTicket {
            key: key.clone(),
            token: lease.token.clone(),
            expires_at: lease.expires_at,
        };
        row.claim = Some(lease);
        ClaimOutcome::Claimed(ticket)
    }

    /// Flip `published` to true for the holder of `ticket`.
    ///
    /// Returns `(row, changed)`. A row that is already published is returned
    /// unchanged: the flag never reverts and never needs a second write.
    pub fn mark_published(
        &mut self,
        ticket: &ClaimTicket,
        now: DateTime<Utc>,
    ) -> Result<(Collision, bool), CollisionStoreError> {
        let row = self
            .rows
            .get_mut(&ticket.key)
            .ok_or_else(|| CollisionStoreError::NotFound(ticket.key.clone()))?;
        if row.published {
            return Ok((row.clone(), false));
        }
        if !holds(row, ticket) {
            return Err(CollisionStoreError::ClaimLost(ticket.key.clone()));
        }
        row.published = true;
        row.published_at = Some(now);
        row.claim = None;
        Ok((row.clone(), true))
    }

    /// Drop the claim held by `ticket`, leaving the row unpublished.
    ///
    /// Returns whether anything changed.
    pub fn release(&mut self, ticket: &ClaimTicket) -> bool {
        match self.rows.get_mut(&ticket.key) {
            Some(row) if !row.published && holds(row, ticket) => {
                row.claim = None;
                true
            }
            _ => false,
        }
    }

    /// Remove every row whose key is not in `keep`. Returns the removed count.
    pub fn retain_keys(&mut self, keep: &BTreeSet<CollisionKey>) -> usize {
        let before = self.rows.len();
        self.rows.retain(|key, _| keep.contains(key));
        before - self.rows.len()
    }

    /// Remove all rows. Returns the removed count.
    pub fn clear(&mut self) -> usize {
        let removed = self.rows.len();
        self.rows.clear();
        removed
    }
}

fn holds(row: &Collision, ticket: &ClaimTicket) -> bool {
    row.claim
        .as_ref()
        .is_some_and(|lease| lease.token == ticket.token)
}

fn validate_request(request: &UpsertRequest) -> Result<(), CollisionStoreError> {
    let invalid = |reason: &str| CollisionStoreError::InvalidRecord {
        key: request.key.clone(),
        reason: reason.to_string(),
    };
    if request.key.situation_id.trim().is_empty() || request.key.route_id.trim().is_empty() {
        return Err(invalid("empty identifier"));
    }
    if !request.nearest_point.is_valid() {
        return Err(invalid("nearest point outside WGS84 bounds"));
    }
    if !(request.distance_km.is_finite() && request.distance_km >= 0.0) {
        return Err(invalid("distance must be finite and non-negative"));
    }
    if !(request.tolerance_km.is_finite() && request.tolerance_km >= 0.0) {
        return Err(invalid("tolerance must be finite and non-negative"));
    }
    Ok(())
}
