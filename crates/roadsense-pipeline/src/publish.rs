//! Publish gate: claim, announce, then mark published.
//!
//! Each unpublished row is claimed with a lease before anything is sent, so
//! overlapping publish cycles never announce the same row twice. A row is
//! marked published only after the transport acknowledged it; on any send
//! failure the claim is released and the row is retried next cycle.
//!
//! A send never outlives the claim lease: its budget is capped at the lease
//! time left minus [`LEASE_MARGIN`], so another cycle cannot take the lease
//! over while a message is still in flight.

use crate::error::CycleError;
use crate::feed::FeedSnapshot;
use crate::message::build_message;
use crate::transport::Transport;
use roadsense_store::{ClaimOutcome, CollisionStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Lease time kept back from every send for the `mark_published` write.
pub const LEASE_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub base_topic: String,
    pub send_timeout: Duration,
    pub cycle_timeout: Duration,
}

impl PublishSettings {
    pub fn validate(&self) -> Result<(), CycleError> {
        if self.base_topic.trim().trim_matches('/').is_empty() {
            return Err(CycleError::InvalidSettings(
                "base_topic must not be empty".to_string(),
            ));
        }
        if self.send_timeout.is_zero() || self.cycle_timeout.is_zero() {
            return Err(CycleError::InvalidSettings(
                "send and cycle timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub cycle_id: String,
    pub found: usize,
    pub published: usize,
    /// Rows another cycle claimed or published first.
    pub claim_conflicts: usize,
    pub transport_failures: usize,
    pub persistence_failures: usize,
    /// Rows left for the next cycle because the cycle deadline passed or the
    /// claim lease was too short to send within.
    pub deferred: usize,
    pub duration_ms: u64,
}

pub struct PublishGate {
    store: Arc<dyn CollisionStore>,
    transport: Arc<dyn Transport>,
    settings: PublishSettings,
}

impl PublishGate {
    pub fn new(
        store: Arc<dyn CollisionStore>,
        transport: Arc<dyn Transport>,
        settings: PublishSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    /// Run one publish cycle, resolving situation attributes from `snapshot`.
    pub async fn run_publish_cycle(
        &self,
        snapshot: &FeedSnapshot,
    ) -> Result<PublishReport, CycleError> {
        self.settings.validate()?;
        let cycle_id = uuid::Uuid::new_v4().simple().to_string();
        let span = tracing::info_span!(
            "publish",
            cycle_id = %cycle_id,
            transport = self.transport.name()
        );
        self.publish_all(cycle_id, snapshot).instrument(span).await
    }

    async fn publish_all(
        &self,
        cycle_id: String,
        snapshot: &FeedSnapshot,
    ) -> Result<PublishReport, CycleError> {
        let started = Instant::now();
        let deadline = started + self.settings.cycle_timeout;
        let rows = self.with_store(|store| store.list_unpublished()).await??;
        let mut report = PublishReport {
            cycle_id,
            found: rows.len(),
            ..PublishReport::default()
        };
        if rows.is_empty() {
            tracing::info!("no unpublished collisions");
        }

        for (idx, row) in rows.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                report.deferred += rows.len() - idx;
                tracing::warn!(deferred = report.deferred, "publish cycle deadline reached");
                break;
            }

            let key = row.key();
            let claimed = {
                let key = key.clone();
                self.with_store(move |store| store.claim(&key)).await?
            };
            let ticket = match claimed {
                Ok(ClaimOutcome::Claimed(ticket)) => ticket,
                Ok(other) => {
                    report.claim_conflicts += 1;
                    tracing::debug!(%key, outcome = ?other, "collision claimed elsewhere");
                    continue;
                }
                Err(err) => {
                    report.persistence_failures += 1;
                    tracing::warn!(%key, error = %err, "claim failed");
                    continue;
                }
            };

            let message = build_message(
                &self.settings.base_topic,
                row,
                snapshot.situation(&row.situation_id),
                snapshot.route(&row.route_id),
            );
            let lease_left = (ticket.expires_at - chrono::Utc::now())
                .to_std()
                .unwrap_or_default()
                .saturating_sub(LEASE_MARGIN);
            if lease_left.is_zero() {
                report.deferred += 1;
                tracing::warn!(%key, expires_at = %ticket.expires_at, "claim lease too short to send");
                let released = self.with_store(move |store| store.release(&ticket)).await?;
                if let Err(err) = released {
                    report.persistence_failures += 1;
                    tracing::warn!(%key, error = %err, "release failed; claim will expire");
                }
                continue;
            }
            let budget = self.settings.send_timeout.min(remaining).min(lease_left);
            let sent = match tokio::time::timeout(budget, self.transport.send(&message)).await {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    tracing::warn!(%key, topic = %message.topic, error = %err, "send failed");
                    false
                }
                Err(_) => {
                    tracing::warn!(%key, topic = %message.topic, timeout_ms = budget.as_millis() as u64, "send timed out");
                    false
                }
            };

            if !sent {
                report.transport_failures += 1;
                let released = {
                    let ticket = ticket.clone();
                    self.with_store(move |store| store.release(&ticket)).await?
                };
                if let Err(err) = released {
                    report.persistence_failures += 1;
                    tracing::warn!(%key, error = %err, "release failed; claim will expire");
                }
                continue;
            }

            match self
                .with_store(move |store| store.mark_published(&ticket))
                .await?
            {
                Ok(_) => {
                    report.published += 1;
                    tracing::info!(%key, topic = %message.topic, "published collision");
                }
                Err(err) => {
                    report.persistence_failures += 1;
                    tracing::error!(%key, error = %err, "sent but not marked published; it will be announced again");
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            found = report.found,
            published = report.published,
            conflicts = report.claim_conflicts,
            transport_failures = report.transport_failures,
            deferred = report.deferred,
            duration_ms = report.duration_ms,
            "publish cycle finished"
        );
        Ok(report)
    }

    /// Store calls block on the lock file, so they run off the async workers.
    async fn with_store<T, F>(&self, op: F) -> Result<T, CycleError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CollisionStore) -> T + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| CycleError::Worker(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use chrono::Utc;
    use roadsense_geo::{Geometry, Position, Route, Severity, Situation, SituationAttributes};
    use roadsense_store::{
        CollisionKey, JsonlCollisionStore, LockPolicy, MemoryCollisionStore, UpsertRequest,
    };
    use std::time::{SystemTime, UNIX_EPOCH};

    fn settings() -> PublishSettings {
        PublishSettings {
            base_topic: "vts/collisions".to_string(),
            send_timeout: Duration::from_secs(5),
            cycle_timeout: Duration::from_secs(60),
        }
    }

    fn snapshot() -> FeedSnapshot {
        let situation = Situation::new("sit-a", Geometry::Point(Position::new(18.9553, 69.6496)))
            .with_attributes(SituationAttributes {
                severity: Severity::High,
                filter_used: "AbnormalTraffic".to_string(),
                ..SituationAttributes::default()
            });
        let route = Route::new(
            "route-1",
            "Line 1",
            vec![Position::new(18.9550, 69.6497), Position::new(18.9400, 69.6600)],
        );
        FeedSnapshot::new(vec![situation], vec![route])
    }

    fn seed(store: &dyn CollisionStore, situation_ids: &[&str]) {
        for id in situation_ids {
            store
                .upsert(&UpsertRequest {
                    key: CollisionKey::new(*id, "route-1"),
                    nearest_point: Position::new(18.9553, 69.6496),
                    distance_km: 0.016,
                    tolerance_km: 0.05,
                })
                .expect("seed row");
        }
    }

    fn gate(store: Arc<dyn CollisionStore>, transport: Arc<dyn Transport>) -> PublishGate {
        PublishGate::new(store, transport, settings())
    }

    #[tokio::test]
    async fn publishes_once_and_marks_row() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["sit-a"]);
        let transport = Arc::new(RecordingTransport::default());
        let gate = gate(store.clone(), transport.clone());

        let first = gate.run_publish_cycle(&snapshot()).await.expect("first cycle");
        assert_eq!(first.found, 1);
        assert_eq!(first.published, 1);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].topic,
            "vts/collisions/route/route-1/severity/high/filter/AbnormalTraffic"
        );
        let row = store
            .get(&CollisionKey::new("sit-a", "route-1"))
            .expect("get")
            .expect("row");
        assert!(row.published);
        assert!(row.published_at.is_some_and(|at| at <= Utc::now()));

        let second = gate.run_publish_cycle(&snapshot()).await.expect("second cycle");
        assert_eq!(second.found, 0);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_releases_claim_for_next_cycle() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["sit-a"]);
        let flaky = Arc::new(RecordingTransport::failing(1));
        let gate = gate(store.clone(), flaky.clone());

        let failed = gate.run_publish_cycle(&snapshot()).await.expect("cycle");
        assert_eq!(failed.transport_failures, 1);
        assert_eq!(failed.published, 0);
        let row = store
            .get(&CollisionKey::new("sit-a", "route-1"))
            .expect("get")
            .expect("row");
        assert!(!row.published);
        assert!(row.claim.is_none());

        let retried = gate.run_publish_cycle(&snapshot()).await.expect("retry");
        assert_eq!(retried.published, 1);
        assert_eq!(flaky.sent().len(), 1);
        assert_eq!(
            flaky.sent()[0].payload.message_id,
            crate::message::message_id(&row)
        );
    }

    #[tokio::test]
    async fn slow_send_times_out_and_stays_unpublished() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["sit-a"]);
        let slow = Arc::new(RecordingTransport::stalling(Duration::from_millis(500)));
        let gate = PublishGate::new(
            store.clone(),
            slow,
            PublishSettings {
                send_timeout: Duration::from_millis(20),
                ..settings()
            },
        );

        let report = gate.run_publish_cycle(&snapshot()).await.expect("cycle");
        assert_eq!(report.transport_failures, 1);
        assert_eq!(store.list_unpublished().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn cycle_deadline_defers_remaining_rows() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["s1", "s2", "s3"]);
        let slow = Arc::new(RecordingTransport::stalling(Duration::from_millis(500)));
        let gate = PublishGate::new(
            store.clone(),
            slow,
            PublishSettings {
                send_timeout: Duration::from_secs(5),
                cycle_timeout: Duration::from_millis(30),
                ..settings()
            },
        );

        let report = gate.run_publish_cycle(&snapshot()).await.expect("cycle");
        assert_eq!(report.found, 3);
        assert_eq!(report.transport_failures, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(store.list_unpublished().expect("list").len(), 3);
    }

    #[tokio::test]
    async fn send_budget_is_capped_by_claim_lease() {
        let store = Arc::new(MemoryCollisionStore::default().with_claim_ttl_seconds(3));
        seed(store.as_ref(), &["sit-a"]);
        let slow = Arc::new(RecordingTransport::stalling(Duration::from_secs(10)));
        let gate = PublishGate::new(
            store.clone(),
            slow.clone(),
            PublishSettings {
                send_timeout: Duration::from_secs(60),
                ..settings()
            },
        );

        let started = Instant::now();
        let report = gate.run_publish_cycle(&snapshot()).await.expect("cycle");
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(report.transport_failures, 1);
        assert!(slow.sent().is_empty());
        let row = store
            .get(&CollisionKey::new("sit-a", "route-1"))
            .expect("get")
            .expect("row");
        assert!(!row.published);
        assert!(row.claim.is_none());
    }

    #[tokio::test]
    async fn spent_lease_skips_send_and_defers_row() {
        let store = Arc::new(MemoryCollisionStore::default().with_claim_ttl_seconds(1));
        seed(store.as_ref(), &["sit-a"]);
        let transport = Arc::new(RecordingTransport::default());
        let report = gate(store.clone(), transport.clone())
            .run_publish_cycle(&snapshot())
            .await
            .expect("cycle");
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 0);
        assert!(transport.sent().is_empty());
        assert!(
            store
                .get(&CollisionKey::new("sit-a", "route-1"))
                .expect("get")
                .expect("row")
                .claim
                .is_none()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_cycle_never_reannounces_in_flight_row() {
        let store = Arc::new(MemoryCollisionStore::default().with_claim_ttl_seconds(2));
        seed(store.as_ref(), &["sit-a"]);
        let slow = Arc::new(RecordingTransport::stalling(Duration::from_millis(2500)));
        let fast = Arc::new(RecordingTransport::default());
        let first = gate(store.clone(), slow.clone());
        let second = gate(store.clone(), fast.clone());

        let snap = snapshot();
        let late = async {
            tokio::time::sleep(Duration::from_millis(2100)).await;
            second.run_publish_cycle(&snap).await
        };
        let (a, b) = tokio::join!(first.run_publish_cycle(&snap), late);
        let (a, b) = (a.expect("first cycle"), b.expect("second cycle"));

        assert_eq!(slow.sent().len() + fast.sent().len(), 1);
        assert_eq!(a.published + b.published, 1);
        assert!(store.list_unpublished().expect("list").is_empty());
    }

    #[tokio::test]
    async fn held_claim_is_a_conflict_not_an_error() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["sit-a"]);
        let key = CollisionKey::new("sit-a", "route-1");
        assert!(store.claim(&key).expect("claim").is_claimed());

        let transport = Arc::new(RecordingTransport::default());
        let report = gate(store, transport.clone())
            .run_publish_cycle(&snapshot())
            .await
            .expect("cycle");
        assert_eq!(report.claim_conflicts, 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_situation_publishes_with_unknown_segments() {
        let store = Arc::new(MemoryCollisionStore::default());
        seed(store.as_ref(), &["vanished"]);
        let transport = Arc::new(RecordingTransport::default());
        gate(store, transport.clone())
            .run_publish_cycle(&snapshot())
            .await
            .expect("cycle");
        assert_eq!(
            transport.sent()[0].topic,
            "vts/collisions/route/route-1/severity/unknown/filter/_unknown_"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cycles_announce_each_row_once() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir()
            .join(format!("roadsense-publish-race-{}-{unique}", std::process::id()))
            .join("collisions.jsonl");
        let open = || {
            Arc::new(
                JsonlCollisionStore::new(&path)
                    .with_lock_policy(LockPolicy::waiting(Duration::from_secs(10))),
            )
        };
        let seed_store = open();
        seed(seed_store.as_ref(), &["s1", "s2", "s3", "s4"]);

        let transport = Arc::new(RecordingTransport::default());
        let left = gate(open(), transport.clone());
        let right = gate(open(), transport.clone());
        let snap = snapshot();
        let (a, b) = tokio::join!(left.run_publish_cycle(&snap), right.run_publish_cycle(&snap));
        let (a, b) = (a.expect("left cycle"), b.expect("right cycle"));

        assert_eq!(a.published + b.published, 4);
        let mut announced: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|m| m.payload.situation_id)
            .collect();
        announced.sort();
        assert_eq!(announced, vec!["s1", "s2", "s3", "s4"]);
        assert!(seed_store.list_unpublished().expect("list").is_empty());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let store = Arc::new(MemoryCollisionStore::default());
        let transport = Arc::new(RecordingTransport::default());
        let gate = PublishGate::new(
            store,
            transport,
            PublishSettings {
                base_topic: "  ".to_string(),
                ..settings()
            },
        );
        assert!(matches!(
            gate.run_publish_cycle(&snapshot()).await,
            Err(CycleError::InvalidSettings(_))
        ));
    }
}
