//! # roadsense-store
//!
//! Durable collision table for the detection/publish pipeline.
//!
//! This crate provides:
//! - `Collision` rows keyed by `(situation_id, route_id)`
//! - JSONL read/write (portable persistence)
//! - `CollisionTable` (canonical in-memory state machine)
//! - `CollisionStore` with JSONL and in-memory backends
//! - claim leases that make "publish at most once" hold across processes
//!
//! ## Row lifecycle
//!
//! ```text
//! upsert ──► unpublished ──claim──► claimed ──mark_published──► published
//!                 ▲                    │
//!                 └──release / expiry──┘
//! ```

pub mod atomic_store;
pub mod claim;
pub mod collision;
pub mod jsonl;
pub mod store;
pub mod table;

pub use atomic_store::{
    AtomicStoreMutationError, DEFAULT_STALE_LOCK_AFTER, LockPolicy, collision_lock_path,
    mutate_table_jsonl,
};
pub use claim::{
    ClaimOutcome, ClaimTicket, DEFAULT_CLAIM_TTL_SECONDS, MAX_CLAIM_TTL_SECONDS,
    MIN_CLAIM_TTL_SECONDS, is_valid_claim_ttl,
};
pub use collision::{ClaimLease, ClaimState, Collision, CollisionKey};
pub use jsonl::{
    JsonlError, read_collisions, read_collisions_from_path, write_collisions,
    write_collisions_to_path,
};
pub use store::{
    BatchOutcome, CollisionStore, JsonlCollisionStore, MemoryCollisionStore, PersistenceFailure,
};
pub use table::{CollisionStoreError, CollisionTable, UpsertChange, UpsertOutcome, UpsertRequest};
