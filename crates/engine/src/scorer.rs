//! Importance scoring.
//!
//! Every branch of a context gets a bounded importance score from a fixed,
//! hand-tuned weighted heuristic over six factors:
//!
//! | Factor | Default weight | Value |
//! |--------|----------------|-------|
//! | frequency | 0.25 | `min(1, accessCount / 100)` |
//! | recency | 0.20 | `exp(-age / 7 days)` |
//! | dependency | 0.20 | `1` if depended upon, else `min(1, deps / 10)` |
//! | semantic | 0.15 | tag overlap with [`REFERENCE_VOCABULARY`] |
//! | userMarked | 0.10 | flag |
//! | systemCritical | 0.10 | flag |
//!
//! The weighted sum is then adjusted for priority, structural complexity and
//! staleness, and clamped to `[0, 1]`.

use chrono::{DateTime, Utc};
use ctxguard_config::ScoringConfig;
use ctxguard_core::{Node, NodePath};
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Tags that count as semantically important.
///
/// Stand-in for an embedding similarity against a reference corpus.
pub const REFERENCE_VOCABULARY: [&str; 8] = [
    "important",
    "critical",
    "core",
    "system",
    "user",
    "config",
    "security",
    "persistent",
];

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;
const RECENCY_HALF_LIFE_MS: f64 = 7.0 * DAY_MS;
const STALENESS_GAP_MS: f64 = 30.0 * DAY_MS;

// ── Types ─────────────────────────────────────────────────────────────────

/// Base weights of the six factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWeights {
    pub frequency: f64,
    pub recency: f64,
    pub dependency: f64,
    pub semantic: f64,
    pub user_marked: f64,
    pub system_critical: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self::from(&ScoringConfig::default())
    }
}

impl From<&ScoringConfig> for ScoreWeights {
    fn from(config: &ScoringConfig) -> Self {
        Self {
            frequency: config.frequency,
            recency: config.recency,
            dependency: config.dependency,
            semantic: config.semantic,
            user_marked: config.user_marked,
            system_critical: config.system_critical,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.frequency
            + self.recency
            + self.dependency
            + self.semantic
            + self.user_marked
            + self.system_critical
    }
}

/// A partial weight update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialWeights {
    pub frequency: Option<f64>,
    pub recency: Option<f64>,
    pub dependency: Option<f64>,
    pub semantic: Option<f64>,
    pub user_marked: Option<f64>,
    pub system_critical: Option<f64>,
}

/// Raw features extracted from a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    /// Milliseconds since `timestamp` (0 when absent).
    pub age_ms: f64,
    /// Milliseconds since `lastAccessed` (equals the age when absent).
    pub last_accessed_ms: f64,
    pub access_frequency: u64,
    pub depth: usize,
    /// Direct key count scaled into `[0, 1]`.
    pub complexity: f64,
    pub tag_similarity: f64,
    pub dependency_count: usize,
    pub is_depended_upon: bool,
    pub user_marked: bool,
    pub system_critical: bool,
    pub priority: f64,
}

/// Weighted contribution of each factor to the base score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub frequency: f64,
    pub recency: f64,
    pub dependency: f64,
    pub semantic: f64,
    pub user_marked: f64,
    pub system_critical: f64,
}

impl ScoreBreakdown {
    pub fn base(&self) -> f64 {
        self.frequency
            + self.recency
            + self.dependency
            + self.semantic
            + self.user_marked
            + self.system_critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportanceScore {
    /// Final score in `[0, 1]`.
    pub score: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub breakdown: ScoreBreakdown,
    pub features: FeatureVector,
}

/// Caller-supplied facts the node itself does not carry.
#[derive(Debug, Clone, Default)]
pub struct ScoringHints {
    /// Precomputed access count; overrides the node's `accessCount`.
    pub access_count: Option<u64>,
    /// Some other node lists this node's id in its `dependencies`.
    pub is_depended_upon: bool,
    pub path: NodePath,
}

// ── Scorer ────────────────────────────────────────────────────────────────

/// The importance scorer. Scoring is pure; only the weights are mutable.
pub struct ImportanceScorer {
    weights: RwLock<ScoreWeights>,
}

impl ImportanceScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            weights: RwLock::new(weights),
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Self {
        Self::new(ScoreWeights::from(config))
    }

    /// Current weights.
    pub fn weights(&self) -> ScoreWeights {
        *self.weights.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge caller-supplied weights into the current ones.
    ///
    /// The result is not renormalized: weights that no longer sum to 1.0
    /// shift every score, and the final clamp absorbs any overshoot.
    pub fn update_weights(&self, partial: &PartialWeights) {
        let mut weights = self.weights.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = partial.frequency {
            weights.frequency = v;
        }
        if let Some(v) = partial.recency {
            weights.recency = v;
        }
        if let Some(v) = partial.dependency {
            weights.dependency = v;
        }
        if let Some(v) = partial.semantic {
            weights.semantic = v;
        }
        if let Some(v) = partial.user_marked {
            weights.user_marked = v;
        }
        if let Some(v) = partial.system_critical {
            weights.system_critical = v;
        }
        tracing::debug!(total = weights.total(), "scoring weights updated");
    }

    /// Score a node as of now.
    pub fn calculate_score(&self, node: &Node, hints: &ScoringHints) -> ImportanceScore {
        self.calculate_score_at(node, hints, Utc::now())
    }

    /// Score a node as of `now`.
    pub fn calculate_score_at(
        &self,
        node: &Node,
        hints: &ScoringHints,
        now: DateTime<Utc>,
    ) -> ImportanceScore {
        let features = extract_features(node, hints, now);
        let weights = self.weights();

        let frequency = (features.access_frequency as f64 / 100.0).min(1.0);
        let recency = (-features.age_ms / RECENCY_HALF_LIFE_MS).exp();
        let dependency = if features.is_depended_upon {
            1.0
        } else {
            (features.dependency_count as f64 / 10.0).min(1.0)
        };

        let breakdown = ScoreBreakdown {
            frequency: frequency * weights.frequency,
            recency: recency * weights.recency,
            dependency: dependency * weights.dependency,
            semantic: features.tag_similarity * weights.semantic,
            user_marked: indicator(features.user_marked) * weights.user_marked,
            system_critical: indicator(features.system_critical) * weights.system_critical,
        };

        let mut score = breakdown.base();
        if features.priority > 0.0 {
            score *= 1.0 + 0.1 * features.priority;
        }
        score *= 1.0 + 0.05 * features.complexity;
        if features.age_ms - features.last_accessed_ms > STALENESS_GAP_MS {
            score *= 0.5;
        }

        ImportanceScore {
            score: score.clamp(0.0, 1.0),
            confidence: confidence(&features, !node.tags().is_empty()),
            breakdown,
            features,
        }
    }
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new(ScoreWeights::default())
    }
}

fn indicator(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

fn confidence(features: &FeatureVector, has_tags: bool) -> f64 {
    // Counted in tenths so that full corroboration lands exactly on 1.0.
    let mut tenths = 5u32;
    if features.access_frequency > 0 {
        tenths += 1;
    }
    if features.dependency_count > 0 || features.is_depended_upon {
        tenths += 1;
    }
    if features.user_marked || features.system_critical {
        tenths += 2;
    }
    if has_tags {
        tenths += 1;
    }
    (f64::from(tenths) / 10.0).min(1.0)
}

/// Extract the feature vector of a node as of `now`.
pub fn extract_features(node: &Node, hints: &ScoringHints, now: DateTime<Utc>) -> FeatureVector {
    let elapsed_ms = |field: &str| {
        node.instant(field)
            .map(|t| (now - t).num_milliseconds().max(0) as f64)
    };
    let age_ms = elapsed_ms("timestamp").unwrap_or(0.0);
    let last_accessed_ms = elapsed_ms("lastAccessed").unwrap_or(age_ms);

    let access_frequency = hints.access_count.unwrap_or_else(|| {
        node.number("accessCount")
            .filter(|n| *n > 0.0)
            .map(|n| n as u64)
            .unwrap_or(0)
    });

    let complexity = node
        .as_branch()
        .map(|map| (map.len() as f64 / 10.0).min(1.0))
        .unwrap_or(0.0);

    let tags = node.tags();
    let tag_similarity = if tags.is_empty() {
        0.0
    } else {
        let hits = tags
            .iter()
            .filter(|tag| {
                let tag = tag.to_ascii_lowercase();
                REFERENCE_VOCABULARY.contains(&tag.as_str())
            })
            .count();
        hits as f64 / tags.len() as f64
    };

    FeatureVector {
        age_ms,
        last_accessed_ms,
        access_frequency,
        depth: hints.path.depth(),
        complexity,
        tag_similarity,
        dependency_count: node.dependencies().len(),
        is_depended_upon: hints.is_depended_upon,
        user_marked: node.flag("userMarked"),
        system_critical: node.flag("systemCritical"),
        priority: node.number("priority").unwrap_or(0.0),
    }
}
