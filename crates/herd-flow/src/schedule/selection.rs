//! Weighted cluster selection for the rollback exercise.
//!
//! The exercise wants coverage, not uniformity: businesses and clusters
//! never exercised come first, repeat successes are de-weighted, and the
//! tendbcluster/tendbha split adapts to what the last window exercised.
//! All pure functions; the sampler takes a caller-supplied RNG so tests are
//! deterministic.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId};

use crate::external::ClusterType;

/// Exercise counts per type in the recent window (last 2h).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentCounts {
    /// Recent tendbcluster exercises.
    pub tendbcluster: u32,
    /// Recent tendbha exercises.
    pub tendbha: u32,
}

/// One selectable cluster with its exercise history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseCandidate {
    /// The cluster.
    pub cluster_id: ClusterId,
    /// Its business.
    pub biz_id: BizId,
    /// Its family (only tendbcluster/tendbha participate).
    pub cluster_type: ClusterType,
    /// Successful exercises recorded for this cluster.
    pub success_count: u32,
    /// When the cluster was last exercised, if ever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exercised_at: Option<DateTime<Utc>>,
    /// Whether any cluster of this business was ever exercised.
    pub biz_ever_exercised: bool,
    /// Most recent backup record, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_backup_at: Option<DateTime<Utc>>,
}

/// Computes the (tendbcluster, tendbha) split for a target of `n`.
///
/// With no recent exercises the split is even. Otherwise the tendbcluster
/// share shrinks as its recent fraction `r` grows:
/// `clamp(0.5 - (r - (1 - r)) * 0.7, 0.2, 0.8)`.
#[must_use]
pub fn split_targets(recent: RecentCounts, n: usize) -> (usize, usize) {
    let total = recent.tendbcluster + recent.tendbha;
    if total == 0 {
        let tendbcluster = n / 2;
        return (tendbcluster, n - tendbcluster);
    }

    let r = f64::from(recent.tendbcluster) / f64::from(total);
    let target_ratio = (0.5 - (r - (1.0 - r)) * 0.7).clamp(0.2, 0.8);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let tendbcluster = ((n as f64) * target_ratio).floor() as usize;
    (tendbcluster, n - tendbcluster)
}

/// Tier priority of a candidate.
///
/// Tier A (business never exercised): 1000. Tier B (cluster never
/// exercised): `500 - 50·success`, floor 100. Tier C: `200 - 20·success`,
/// floor 50.
#[must_use]
pub fn tier_priority(candidate: &ExerciseCandidate) -> u32 {
    if !candidate.biz_ever_exercised {
        return 1000;
    }
    if candidate.last_exercised_at.is_none() {
        return 500_u32
            .saturating_sub(candidate.success_count.saturating_mul(50))
            .max(100);
    }
    200_u32
        .saturating_sub(candidate.success_count.saturating_mul(20))
        .max(50)
}

/// Sampling weight of a candidate: `1 / (1 + success · 0.5)`, floor 0.1.
#[must_use]
pub fn candidate_weight(candidate: &ExerciseCandidate) -> f64 {
    (1.0 / (1.0 + f64::from(candidate.success_count) * 0.5)).max(0.1)
}

/// Weighted sampling without replacement from `pool`, up to `count` picks.
fn weighted_take<R: Rng + ?Sized>(
    pool: &mut Vec<ExerciseCandidate>,
    count: usize,
    rng: &mut R,
) -> Vec<ExerciseCandidate> {
    let mut picked = Vec::new();
    while picked.len() < count && !pool.is_empty() {
        let total: f64 = pool.iter().map(candidate_weight).sum();
        let mut x = rng.gen_range(0.0..total);
        let mut chosen = pool.len() - 1;
        for (i, candidate) in pool.iter().enumerate() {
            let w = candidate_weight(candidate);
            if x < w {
                chosen = i;
                break;
            }
            x -= w;
        }
        picked.push(pool.remove(chosen));
    }
    picked
}

/// Samples `target` candidates from one type bucket, tier by tier.
fn take_from_bucket<R: Rng + ?Sized>(
    bucket: Vec<ExerciseCandidate>,
    target: usize,
    rng: &mut R,
) -> (Vec<ExerciseCandidate>, Vec<ExerciseCandidate>) {
    let mut by_priority = bucket;
    by_priority.sort_by(|a, b| {
        tier_priority(b)
            .cmp(&tier_priority(a))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    let mut picked = Vec::new();
    let mut leftover = Vec::new();
    let mut idx = 0;
    while idx < by_priority.len() {
        let priority = tier_priority(&by_priority[idx]);
        let mut group: Vec<ExerciseCandidate> = Vec::new();
        while idx < by_priority.len() && tier_priority(&by_priority[idx]) == priority {
            group.push(by_priority[idx].clone());
            idx += 1;
        }

        let want = target.saturating_sub(picked.len());
        let mut group_pool = group;
        let taken = weighted_take(&mut group_pool, want, rng);
        picked.extend(taken);
        leftover.extend(group_pool);
    }
    (picked, leftover)
}

/// Selects up to `n` clusters to exercise.
///
/// Excludes clusters exercised within the last 24h and clusters without a
/// backup record inside the look-back window; splits the target across the
/// two families per [`split_targets`]; samples each bucket tier by tier with
/// [`candidate_weight`]; tops a short bucket up from the cross-type
/// remainder.
#[must_use]
pub fn select_clusters<R: Rng + ?Sized>(
    candidates: &[ExerciseCandidate],
    n: usize,
    recent: RecentCounts,
    now: DateTime<Utc>,
    backup_lookback: Duration,
    rng: &mut R,
) -> Vec<ExerciseCandidate> {
    let eligible: Vec<ExerciseCandidate> = candidates
        .iter()
        .filter(|c| {
            matches!(
                c.cluster_type,
                ClusterType::TendbCluster | ClusterType::TendbHa
            )
        })
        .filter(|c| {
            c.last_exercised_at
                .is_none_or(|t| now - t >= Duration::hours(24))
        })
        .filter(|c| {
            c.latest_backup_at
                .is_some_and(|t| now - t <= backup_lookback)
        })
        .cloned()
        .collect();

    let (tendbcluster_target, tendbha_target) = split_targets(recent, n);

    let (tendbcluster_pool, tendbha_pool): (Vec<_>, Vec<_>) = eligible
        .into_iter()
        .partition(|c| c.cluster_type == ClusterType::TendbCluster);

    let (mut picked, leftover_tc) = take_from_bucket(tendbcluster_pool, tendbcluster_target, rng);
    let (picked_ha, leftover_ha) = take_from_bucket(tendbha_pool, tendbha_target, rng);
    picked.extend(picked_ha);

    // Cross-type top-up with the same weighting.
    if picked.len() < n {
        let mut remainder: Vec<ExerciseCandidate> =
            leftover_tc.into_iter().chain(leftover_ha).collect();
        let taken = weighted_take(&mut remainder, n - picked.len(), rng);
        picked.extend(taken);
    }

    picked
}
