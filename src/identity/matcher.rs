use super::{IdentitySnapshot, SnapshotHandle, EMBEDDING_DIM};

pub const DEFAULT_TOLERANCE: f32 = 0.42;
pub const DEFAULT_MARGIN: f32 = 0.10;

/// Distance assumed for the runner-up when only one identity is enrolled.
const LONE_IDENTITY_SECOND_BEST: f32 = 1.0;
/// Steepness of the distance-to-confidence logistic curve.
const CONFIDENCE_SLOPE: f32 = 6.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatcherThresholds {
    /// Maximum distance for a match to count.
    pub tolerance: f32,
    /// Minimum gap between best and second-best identity distances.
    pub margin: f32,
}

impl Default for MatcherThresholds {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            margin: DEFAULT_MARGIN,
        }
    }
}

/// Result of matching one embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchOutcome {
    /// Set only when the match was accepted.
    pub identity_id: Option<String>,
    /// Display name when accepted, otherwise `Unknown <best>` or `Ambiguous`.
    pub label: String,
    pub confidence: f32,
}

impl MatchOutcome {
    fn unknown() -> Self {
        Self {
            identity_id: None,
            label: "Unknown".to_string(),
            confidence: 0.0,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.identity_id.is_some()
    }
}

/// Nearest-identity lookup over the current snapshot.
///
/// Holds no lock; every call loads the snapshot once and works on that view.
#[derive(Clone)]
pub struct IdentityMatcher {
    snapshot: SnapshotHandle,
    thresholds: MatcherThresholds,
}

impl IdentityMatcher {
    pub fn new(snapshot: SnapshotHandle, thresholds: MatcherThresholds) -> Self {
        Self {
            snapshot,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> MatcherThresholds {
        self.thresholds
    }

    pub fn match_embedding(&self, embedding: &[f32]) -> MatchOutcome {
        let snapshot = self.snapshot.load();
        match_against(&snapshot, embedding, self.thresholds)
    }
}

/// Match `query` against `snapshot`.
pub fn match_against(
    snapshot: &IdentitySnapshot,
    query: &[f32],
    thresholds: MatcherThresholds,
) -> MatchOutcome {
    if snapshot.is_empty() {
        return MatchOutcome::unknown();
    }
    if query.len() != EMBEDDING_DIM {
        log::warn!(
            "query embedding has {} values, expected {}",
            query.len(),
            EMBEDDING_DIM
        );
        return MatchOutcome::unknown();
    }

    let per_identity = identity_distances(snapshot, query);
    let mut ranked: Vec<(usize, f32)> = per_identity
        .into_iter()
        .enumerate()
        .filter(|(_, d)| d.is_finite())
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    let Some(&(best_idx, best)) = ranked.first() else {
        return MatchOutcome::unknown();
    };
    let second = ranked
        .get(1)
        .map(|&(_, d)| d)
        .unwrap_or(LONE_IDENTITY_SECOND_BEST);
    let confidence = confidence(best, thresholds.tolerance);

    if best >= thresholds.tolerance {
        return MatchOutcome {
            identity_id: None,
            label: format!("Unknown {:.2}", best),
            confidence,
        };
    }
    if second - best < thresholds.margin {
        return MatchOutcome {
            identity_id: None,
            label: "Ambiguous".to_string(),
            confidence,
        };
    }

    let identity = &snapshot.identities()[best_idx];
    MatchOutcome {
        identity_id: Some(identity.id.clone()),
        label: identity.name.clone(),
        confidence,
    }
}

/// Minimum Euclidean distance from `query` to each identity's samples.
///
/// Uses `‖a‖² + ‖b‖² − 2·a·b`; rounding can push that slightly below zero, so
/// it is clamped before the square root.
fn identity_distances(snapshot: &IdentitySnapshot, query: &[f32]) -> Vec<f32> {
    let query_norm_sq: f32 = query.iter().map(|v| v * v).sum();
    let mut best = vec![f32::INFINITY; snapshot.identity_count()];
    for row in 0..snapshot.sample_count() {
        let dot: f32 = snapshot
            .sample(row)
            .iter()
            .zip(query)
            .map(|(a, b)| a * b)
            .sum();
        let d_sq = (query_norm_sq + snapshot.sample_norm_sq(row) - 2.0 * dot).max(0.0);
        let d = d_sq.sqrt();
        let owner = snapshot.sample_owner(row);
        if d < best[owner] {
            best[owner] = d;
        }
    }
    best
}

fn confidence(best: f32, tolerance: f32) -> f32 {
    1.0 / (1.0 + (CONFIDENCE_SLOPE * (best - tolerance)).exp())
}
