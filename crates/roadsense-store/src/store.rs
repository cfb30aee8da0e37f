//! The `CollisionStore` contract and its two backends.
//!
//! `JsonlCollisionStore` is the durable, multi-process backend: reads see the
//! last atomically renamed file and every mutation runs in one lock scope.
//! `MemoryCollisionStore` keeps the same state machine behind a mutex.

use crate::atomic_store::{LockPolicy, mutate_table_jsonl};
use crate::claim::{ClaimOutcome, ClaimTicket, DEFAULT_CLAIM_TTL_SECONDS};
use crate::collision::{Collision, CollisionKey};
use crate::table::{
    CollisionStoreError, CollisionTable, UpsertChange, UpsertOutcome, UpsertRequest,
};
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// One upsert that could not be applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceFailure {
    pub key: CollisionKey,
    pub message: String,
}

/// Result of a batch upsert: per-row outcomes and per-row failures.
///
/// A failure on one row never discards the others.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub applied: Vec<UpsertOutcome>,
    pub failures: Vec<PersistenceFailure>,
}

pub trait CollisionStore: Send + Sync {
    fn upsert(&self, request: &UpsertRequest) -> Result<UpsertOutcome, CollisionStoreError>;

    fn upsert_batch(&self, requests: &[UpsertRequest]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for request in requests {
            match self.upsert(request) {
                Ok(applied) => outcome.applied.push(applied),
                Err(err) => outcome.failures.push(PersistenceFailure {
                    key: request.key.clone(),
                    message: err.to_string(),
                }),
            }
        }
        outcome
    }

    /// Unpublished rows, oldest detection first.
    fn list_unpublished(&self) -> Result<Vec<Collision>, CollisionStoreError>;

    fn list_all(&self) -> Result<Vec<Collision>, CollisionStoreError>;

    fn get(&self, key: &CollisionKey) -> Result<Option<Collision>, CollisionStoreError>;

    /// Atomically reserve an unpublished row for publishing.
    fn claim(&self, key: &CollisionKey) -> Result<ClaimOutcome, CollisionStoreError>;

    fn mark_published(&self, ticket: &ClaimTicket) -> Result<Collision, CollisionStoreError>;

    fn release(&self, ticket: &ClaimTicket) -> Result<bool, CollisionStoreError>;

    /// Remove rows not in `keep`. Returns the removed count.
    fn retain_only(&self, keep: &BTreeSet<CollisionKey>) -> Result<usize, CollisionStoreError>;

    fn clear(&self) -> Result<usize, CollisionStoreError>;
}

fn claim_ttl(seconds: i64) -> Duration {
    Duration::seconds(seconds)
}

#[derive(Debug, Clone)]
pub struct JsonlCollisionStore {
    path: PathBuf,
    claim_ttl_seconds: i64,
    lock_policy: LockPolicy,
}

impl JsonlCollisionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            claim_ttl_seconds: DEFAULT_CLAIM_TTL_SECONDS,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_claim_ttl_seconds(mut self, seconds: i64) -> Self {
        self.claim_ttl_seconds = seconds;
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<T>(
        &self,
        mutator: impl FnOnce(&mut CollisionTable) -> Result<(T, bool), CollisionStoreError>,
    ) -> Result<T, CollisionStoreError> {
        mutate_table_jsonl(&self.path, self.lock_policy, mutator).map_err(Into::into)
    }
}

impl CollisionStore for JsonlCollisionStore {
    fn upsert(&self, request: &UpsertRequest) -> Result<UpsertOutcome, CollisionStoreError> {
        self.mutate(|table| {
            let outcome = table.upsert(request, Utc::now())?;
            let changed = outcome.change != UpsertChange::Unchanged;
            Ok((outcome, changed))
        })
    }

    fn upsert_batch(&self, requests: &[UpsertRequest]) -> BatchOutcome {
        if requests.is_empty() {
            return BatchOutcome::default();
        }
        let result = self.mutate(|table| {
            let now = Utc::now();
            let mut outcome = BatchOutcome::default();
            for request in requests {
                match table.upsert(request, now) {
                    Ok(applied) => outcome.applied.push(applied),
                    Err(err) => outcome.failures.push(PersistenceFailure {
                        key: request.key.clone(),
                        message: err.to_string(),
                    }),
                }
            }
            let changed = outcome
                .applied
                .iter()
                .any(|applied| applied.change != UpsertChange::Unchanged);
            Ok((outcome, changed))
        });
        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, rows = requests.len(), "batch upsert failed");
                let message = err.to_string();
                BatchOutcome {
                    applied: Vec::new(),
                    failures: requests
                        .iter()
                        .map(|request| PersistenceFailure {
                            key: request.key.clone(),
                            message: message.clone(),
                        })
                        .collect(),
                }
            }
        }
    }

    fn list_unpublished(&self) -> Result<Vec<Collision>, CollisionStoreError> {
        let table = CollisionTable::load_jsonl(&self.path)?;
        Ok(table.unpublished().into_iter().cloned().collect())
    }

    fn list_all(&self) -> Result<Vec<Collision>, CollisionStoreError> {
        let table = CollisionTable::load_jsonl(&self.path)?;
        Ok(table.collisions().cloned().collect())
    }

    fn get(&self, key: &CollisionKey) -> Result<Option<Collision>, CollisionStoreError> {
        let table = CollisionTable::load_jsonl(&self.path)?;
        Ok(table.get(key).cloned())
    }

    fn claim(&self, key: &CollisionKey) -> Result<ClaimOutcome, CollisionStoreError> {
        let ttl = claim_ttl(self.claim_ttl_seconds);
        self.mutate(|table| {
            let outcome = table.claim(key, Utc::now(), ttl);
            let changed = outcome.is_claimed();
            Ok((outcome, changed))
        })
    }

    fn mark_published(&self, ticket: &ClaimTicket) -> Result<Collision, CollisionStoreError> {
        self.mutate(|table| table.mark_published(ticket, Utc::now()))
    }

    fn release(&self, ticket: &ClaimTicket) -> Result<bool, CollisionStoreError> {
        self.mutate(|table| {
            let released = table.release(ticket);
            Ok((released, released))
        })
    }

    fn retain_only(&self, keep: &BTreeSet<CollisionKey>) -> Result<usize, CollisionStoreError> {
        self.mutate(|table| {
            let removed = table.retain_keys(keep);
            Ok((removed, removed > 0))
        })
    }

    fn clear(&self) -> Result<usize, CollisionStoreError> {
        self.mutate(|table| {
            let removed = table.clear();
            Ok((removed, removed > 0))
        })
    }
}

/// In-process store over a single mutex-guarded table.
#[derive(Debug)]
pub struct MemoryCollisionStore {
    table: Mutex<CollisionTable>,
    claim_ttl_seconds: i64,
}

impl Default for MemoryCollisionStore {
    fn default() -> Self {
        Self {
            table: Mutex::new(CollisionTable::default()),
            claim_ttl_seconds: DEFAULT_CLAIM_TTL_SECONDS,
        }
    }
}

impl MemoryCollisionStore {
    pub fn with_claim_ttl_seconds(mut self, seconds: i64) -> Self {
        self.claim_ttl_seconds = seconds;
        self
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut CollisionTable) -> T) -> T {
        let mut guard = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl CollisionStore for MemoryCollisionStore {
    fn upsert(&self, request: &UpsertRequest) -> Result<UpsertOutcome, CollisionStoreError> {
        self.with_table(|table| table.upsert(request, Utc::now()))
    }

    fn list_unpublished(&self) -> Result<Vec<Collision>, CollisionStoreError> {
        Ok(self.with_table(|table| table.unpublished().into_iter().cloned().collect()))
    }

    fn list_all(&self) -> Result<Vec<Collision>, CollisionStoreError> {
        Ok(self.with_table(|table| table.collisions().cloned().collect()))
    }

    fn get(&self, key: &CollisionKey) -> Result<Option<Collision>, CollisionStoreError> {
        Ok(self.with_table(|table| table.get(key).cloned()))
    }

    fn claim(&self, key: &CollisionKey) -> Result<ClaimOutcome, CollisionStoreError> {
        let ttl = claim_ttl(self.claim_ttl_seconds);
        Ok(self.with_table(|table| table.claim(key, Utc::now(), ttl)))
    }

    fn mark_published(&self, ticket: &ClaimTicket) -> Result<Collision, CollisionStoreError> {
        self.with_table(|table| table.mark_published(ticket, Utc::now()))
            .map(|(row, _)| row)
    }

    fn release(&self, ticket: &ClaimTicket) -> Result<bool, CollisionStoreError> {
        Ok(self.with_table(|table| table.release(ticket)))
    }

    fn retain_only(&self, keep: &BTreeSet<CollisionKey>) -> Result<usize, CollisionStoreError> {
        Ok(self.with_table(|table| table.retain_keys(keep)))
    }

    fn clear(&self) -> Result<usize, CollisionStoreError> {
        Ok(self.with_table(CollisionTable::clear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_store::collision_lock_path;
    use roadsense_geo::Position;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store(prefix: &str) -> JsonlCollisionStore {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "roadsense-store-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("temp dir should be created");
        JsonlCollisionStore::new(root.join("collisions.jsonl"))
            .with_lock_policy(LockPolicy::waiting(std::time::Duration::from_secs(10)))
    }

    fn request(situation_id: &str, route_id: &str) -> UpsertRequest {
        UpsertRequest {
            key: CollisionKey::new(situation_id, route_id),
            nearest_point: Position::new(18.9553, 69.6496),
            distance_km: 0.016,
            tolerance_km: 0.05,
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let store = temp_store("empty");
        assert!(store.list_all().expect("list").is_empty());
        assert!(store.list_unpublished().expect("list").is_empty());
        assert_eq!(
            store.get(&CollisionKey::new("s1", "r1")).expect("get"),
            None
        );
    }

    #[test]
    fn upsert_is_idempotent_across_calls() {
        let store = temp_store("idempotent");
        let first = store.upsert(&request("s1", "r1")).expect("first upsert");
        let second = store.upsert(&request("s1", "r1")).expect("second upsert");
        assert_eq!(
            first.collision.detection_timestamp,
            second.collision.detection_timestamp
        );
        assert_eq!(store.list_all().expect("list").len(), 1);
    }

    #[test]
    fn batch_keeps_good_rows_when_one_is_invalid() {
        let store = temp_store("batch");
        let mut bad = request("s2", "r1");
        bad.distance_km = f64::NAN;
        let outcome = store.upsert_batch(&[request("s1", "r1"), bad, request("s3", "r1")]);
        assert_eq!(outcome.applied.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, CollisionKey::new("s2", "r1"));
        assert_eq!(store.list_all().expect("list").len(), 2);
    }

    #[test]
    fn batch_reports_every_row_when_the_lock_is_busy() {
        let store = temp_store("batch-busy").with_lock_policy(LockPolicy::NO_WAIT);
        let lock_path = collision_lock_path(store.path());
        fs::write(&lock_path, "busy\n").expect("lock should be created");

        let outcome = store.upsert_batch(&[request("s1", "r1"), request("s2", "r1")]);
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[0].message.contains("lock busy"));
        let _ = fs::remove_file(lock_path);
    }

    #[test]
    fn claim_publish_round_trip_persists_flag() {
        let store = temp_store("publish");
        store.upsert(&request("s1", "r1")).expect("upsert");
        let key = CollisionKey::new("s1", "r1");

        let ticket = store
            .claim(&key)
            .expect("claim")
            .ticket()
            .expect("should be claimed");
        assert!(matches!(
            store.claim(&key).expect("second claim"),
            ClaimOutcome::Held { .. }
        ));

        let published = store.mark_published(&ticket).expect("mark");
        assert!(published.published);
        assert!(published.published_at.is_some());
        assert!(store.list_unpublished().expect("list").is_empty());
        assert_eq!(
            store.claim(&key).expect("claim after publish"),
            ClaimOutcome::AlreadyPublished
        );
    }

    #[test]
    fn release_returns_row_to_the_queue() {
        let store = temp_store("release");
        store.upsert(&request("s1", "r1")).expect("upsert");
        let key = CollisionKey::new("s1", "r1");
        let ticket = store.claim(&key).expect("claim").ticket().expect("ticket");

        assert!(store.release(&ticket).expect("release"));
        assert!(!store.release(&ticket).expect("second release"));
        let row = store.get(&key).expect("get").expect("row");
        assert!(!row.published);
        assert!(row.claim.is_none());
        assert!(store.claim(&key).expect("reclaim").is_claimed());
    }

    #[test]
    fn retain_only_and_clear() {
        let store = temp_store("retain");
        store.upsert_batch(&[request("s1", "r1"), request("s2", "r1"), request("s3", "r1")]);
        let keep: BTreeSet<_> = [CollisionKey::new("s2", "r1")].into_iter().collect();
        assert_eq!(store.retain_only(&keep).expect("retain"), 2);
        assert_eq!(store.list_all().expect("list").len(), 1);
        assert_eq!(store.clear().expect("clear"), 1);
        assert_eq!(store.clear().expect("clear again"), 0);
    }

    #[test]
    fn concurrent_claims_yield_exactly_one_winner() {
        let store = temp_store("race");
        store.upsert(&request("s1", "r1")).expect("upsert");
        let key = CollisionKey::new("s1", "r1");

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.claim(&key).expect("claim should not error")
                })
            })
            .collect();

        let outcomes: Vec<ClaimOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().expect("worker should join"))
            .collect();
        let winners = outcomes.iter().filter(|o| o.is_claimed()).count();
        assert_eq!(winners, 1);
        assert!(
            outcomes
                .iter()
                .filter(|o| !o.is_claimed())
                .all(|o| matches!(o, ClaimOutcome::Held { .. }))
        );
    }

    #[test]
    fn memory_store_matches_jsonl_semantics() {
        let store = MemoryCollisionStore::default();
        store.upsert(&request("s1", "r1")).expect("upsert");
        let key = CollisionKey::new("s1", "r1");
        let ticket = store.claim(&key).expect("claim").ticket().expect("ticket");
        assert!(matches!(
            store.claim(&key).expect("second"),
            ClaimOutcome::Held { .. }
        ));
        store.mark_published(&ticket).expect("mark");
        // Idempotent once published.
        assert!(store.mark_published(&ticket).expect("mark again").published);
        assert!(store.list_unpublished().expect("list").is_empty());
    }
}
