//! Detection cycle: normalize, match every (situation, route) pair, upsert.

use crate::error::CycleError;
use crate::feed::FeedSnapshot;
use rayon::prelude::*;
use roadsense_geo::{
    BoundingBox, MatchComputeError, MatchOutcome, NormalizedSituation, RouteLine, match_situation,
    normalize_within,
};
use roadsense_store::{
    CollisionKey, CollisionStore, CollisionStoreError, UpsertChange, UpsertRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Instant;

/// What happens to stored rows that were not re-detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Add and refresh only; stale rows stay.
    #[default]
    Incremental,
    /// Prune rows whose pair was not detected this cycle.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub tolerance_km: f64,
    pub mode: DetectionMode,
    /// Optional area of interest; primitives entirely outside it are ignored.
    pub area: Option<BoundingBox>,
}

impl DetectionSettings {
    pub fn validate(&self) -> Result<(), CycleError> {
        if !(self.tolerance_km.is_finite() && self.tolerance_km > 0.0) {
            return Err(CycleError::InvalidSettings(format!(
                "tolerance_km must be finite and positive, got {}",
                self.tolerance_km
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub cycle_id: String,
    pub mode: DetectionMode,
    pub tolerance_km: f64,
    pub situations_total: usize,
    /// Situations with no usable primitive after normalization.
    pub situations_skipped: usize,
    pub geometry_warnings: usize,
    pub features_skipped: usize,
    pub routes_total: usize,
    pub routes_skipped: usize,
    pub routes_outside_area: usize,
    pub pairs_evaluated: usize,
    pub pairs_prefiltered: usize,
    pub match_errors: usize,
    pub collisions_found: usize,
    pub created: usize,
    pub refreshed: usize,
    pub unchanged: usize,
    pub persistence_failures: usize,
    pub pruned: usize,
    pub duration_ms: u64,
}

/// Pure matching result, before anything touches the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionMatches {
    pub requests: Vec<UpsertRequest>,
    pub situations_total: usize,
    pub situations_skipped: usize,
    pub geometry_warnings: usize,
    pub routes_total: usize,
    pub routes_skipped: usize,
    pub routes_outside_area: usize,
    pub pairs_evaluated: usize,
    pub pairs_prefiltered: usize,
    pub match_errors: usize,
    /// Pairs whose distance could not be computed; their state is unknown.
    pub failed_pairs: Vec<CollisionKey>,
}

enum PairResult {
    Collision(UpsertRequest),
    Miss,
    Prefiltered,
    Failed(CollisionKey, MatchComputeError),
}

/// Match every situation against every route in parallel.
///
/// Output order is deterministic: situations in feed order, then routes in
/// feed order.
pub fn find_collisions(snapshot: &FeedSnapshot, settings: &DetectionSettings) -> DetectionMatches {
    let area = settings.area.as_ref();
    let normalized: Vec<NormalizedSituation<'_>> = snapshot
        .situations()
        .par_iter()
        .map(|situation| normalize_within(situation, area))
        .collect();

    let mut routes_skipped = 0;
    let mut routes_outside_area = 0;
    let routes: Vec<RouteLine<'_>> = snapshot
        .routes()
        .iter()
        .filter_map(|route| match RouteLine::new(route) {
            Ok(line) if area.is_some_and(|a| !a.intersects(line.bbox())) => {
                routes_outside_area += 1;
                None
            }
            Ok(line) => Some(line),
            Err(err) => {
                routes_skipped += 1;
                tracing::warn!(route_id = %route.id, error = %err, "skipping route geometry");
                None
            }
        })
        .collect();

    let geometry_warnings = normalized.iter().map(|n| n.warnings.len()).sum();
    let usable: Vec<&NormalizedSituation<'_>> = normalized.iter().filter(|n| !n.is_empty()).collect();
    let situations_skipped = normalized.len() - usable.len();

    let tolerance_km = settings.tolerance_km;
    let results: Vec<PairResult> = usable
        .par_iter()
        .flat_map_iter(|situation| {
            routes
                .iter()
                .map(move |route| pair_result(situation, route, tolerance_km))
        })
        .collect();

    let mut matches = DetectionMatches {
        situations_total: normalized.len(),
        situations_skipped,
        geometry_warnings,
        routes_total: snapshot.routes().len(),
        routes_skipped,
        routes_outside_area,
        pairs_evaluated: results.len(),
        ..DetectionMatches::default()
    };
    for result in results {
        match result {
            PairResult::Collision(request) => matches.requests.push(request),
            PairResult::Miss => {}
            PairResult::Prefiltered => matches.pairs_prefiltered += 1,
            PairResult::Failed(key, err) => {
                matches.match_errors += 1;
                tracing::warn!(%key, error = %err, "skipping pair after distance failure");
                matches.failed_pairs.push(key);
            }
        }
    }
    matches
}

fn pair_result(
    situation: &NormalizedSituation<'_>,
    route: &RouteLine<'_>,
    tolerance_km: f64,
) -> PairResult {
    match match_situation(situation, route, tolerance_km) {
        Ok(Some(MatchOutcome {
            is_collision: true,
            distance_km,
            nearest_point,
            ..
        })) => PairResult::Collision(UpsertRequest {
            key: CollisionKey::new(situation.id(), route.id()),
            nearest_point,
            distance_km,
            tolerance_km,
        }),
        Ok(Some(_)) => PairResult::Miss,
        Ok(None) => PairResult::Prefiltered,
        Err(err) => PairResult::Failed(CollisionKey::new(situation.id(), route.id()), err),
    }
}

/// Full-recompute prune: drop rows this cycle neither detected nor failed on.
///
/// Failed upserts and failed distance computations both keep their row, so a
/// transient error never erases a live collision's publish state.
fn prune_undetected(
    store: &dyn CollisionStore,
    matches: &DetectionMatches,
) -> Result<usize, CollisionStoreError> {
    let keep: BTreeSet<CollisionKey> = matches
        .requests
        .iter()
        .map(|r| r.key.clone())
        .chain(matches.failed_pairs.iter().cloned())
        .collect();
    store.retain_only(&keep)
}

/// Run one detection cycle against `store`.
pub fn run_detection_cycle(
    store: &dyn CollisionStore,
    snapshot: &FeedSnapshot,
    settings: &DetectionSettings,
) -> Result<DetectionReport, CycleError> {
    settings.validate()?;
    let started = Instant::now();
    let cycle_id = uuid::Uuid::new_v4().simple().to_string();
    let span = tracing::info_span!("detect", cycle_id = %cycle_id);
    let _entered = span.enter();

    let matches = find_collisions(snapshot, settings);
    let batch = store.upsert_batch(&matches.requests);
    for failure in &batch.failures {
        tracing::error!(key = %failure.key, error = %failure.message, "failed to persist collision");
    }

    let mut report = DetectionReport {
        cycle_id: cycle_id.clone(),
        mode: settings.mode,
        tolerance_km: settings.tolerance_km,
        situations_total: matches.situations_total,
        situations_skipped: matches.situations_skipped,
        geometry_warnings: matches.geometry_warnings,
        features_skipped: snapshot.skipped_situation_features + snapshot.skipped_route_features,
        routes_total: matches.routes_total,
        routes_skipped: matches.routes_skipped,
        routes_outside_area: matches.routes_outside_area,
        pairs_evaluated: matches.pairs_evaluated,
        pairs_prefiltered: matches.pairs_prefiltered,
        match_errors: matches.match_errors,
        collisions_found: matches.requests.len(),
        persistence_failures: batch.failures.len(),
        ..DetectionReport::default()
    };
    for applied in &batch.applied {
        match applied.change {
            UpsertChange::Created => report.created += 1,
            UpsertChange::Refreshed => report.refreshed += 1,
            UpsertChange::Unchanged => report.unchanged += 1,
        }
    }

    if settings.mode == DetectionMode::Full {
        report.pruned = prune_undetected(store, &matches)?;
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        collisions = report.collisions_found,
        created = report.created,
        refreshed = report.refreshed,
        pruned = report.pruned,
        failures = report.persistence_failures,
        duration_ms = report.duration_ms,
        "detection cycle finished"
    );
    Ok(report)
}
