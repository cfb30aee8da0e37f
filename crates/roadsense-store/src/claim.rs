//! Claim leases: the publish gate's atomic reservation of a row.
//!
//! A claim is a compare-and-set on `(published == false, no live claim)`.
//! Leases expire so that a cycle that died mid-flight cannot wedge a row.

use crate::collision::CollisionKey;
use chrono::{DateTime, Utc};

pub const DEFAULT_CLAIM_TTL_SECONDS: i64 = 300;
pub const MIN_CLAIM_TTL_SECONDS: i64 = 30;
pub const MAX_CLAIM_TTL_SECONDS: i64 = 86_400;

/// Proof of a successful claim; required to publish or release the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    pub key: CollisionKey,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimTicket),
    /// The row was published by an earlier cycle.
    AlreadyPublished,
    /// Another cycle holds a live claim.
    Held { expires_at: DateTime<Utc> },
    /// The row disappeared (cleared or pruned) since it was listed.
    NotFound,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed(_))
    }

    pub fn ticket(self) -> Option<ClaimTicket> {
        match self {
            Self::Claimed(ticket) => Some(ticket),
            _ => None,
        }
    }
}

pub fn is_valid_claim_ttl(seconds: i64) -> bool {
    (MIN_CLAIM_TTL_SECONDS..=MAX_CLAIM_TTL_SECONDS).contains(&seconds)
}

pub(crate) fn new_claim_token() -> String {
    format!("claim1_{}", uuid::Uuid::new_v4().simple())
}
