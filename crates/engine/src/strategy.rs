//! Resistance strategies and the structural transforms behind them.

use crate::compressor::CompressionLevel;
use crate::scorer::ImportanceScore;
use ctxguard_core::{Node, NodeError, NodePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bucket bounds used by [`Strategy::Aggressive`].
const CRITICAL_BOUND: f64 = 0.8;
const IMPORTANT_BOUND: f64 = 0.6;
const STANDARD_BOUND: f64 = 0.4;

/// Names of the aggressive buckets, in output order.
pub const BUCKETS: [&str; 4] = ["critical", "important", "standard", "low"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    LowMemory,
    HighImportance,
    Balanced,
    Aggressive,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowMemory => "lowMemory",
            Self::HighImportance => "highImportance",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }

    /// Compression applied to the retained tree.
    pub fn compression_level(self) -> CompressionLevel {
        match self {
            Self::LowMemory => CompressionLevel::Heavy,
            Self::HighImportance => CompressionLevel::Light,
            Self::Balanced => CompressionLevel::Moderate,
            Self::Aggressive => CompressionLevel::None,
        }
    }

    /// Minimum score a branch needs to be kept whole. `None` keeps everything.
    pub fn retention_threshold(self) -> Option<f64> {
        match self {
            Self::LowMemory => Some(0.8),
            Self::HighImportance => Some(0.5),
            Self::Balanced => Some(0.6),
            Self::Aggressive => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    /// Accepts `lowMemory`, `low-memory` and `low_memory` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "lowmemory" => Ok(Self::LowMemory),
            "highimportance" => Ok(Self::HighImportance),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            _ => Err(format!("unknown strategy '{s}'")),
        }
    }
}

// ── Score table ───────────────────────────────────────────────────────────

/// Importance scores keyed by structural path.
#[derive(Debug, Clone, Default)]
pub struct ScoreTable {
    scores: BTreeMap<NodePath, ImportanceScore>,
}

impl ScoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: NodePath, score: ImportanceScore) {
        self.scores.insert(path, score);
    }

    pub fn get(&self, path: &NodePath) -> Option<&ImportanceScore> {
        self.scores.get(path)
    }

    pub fn score(&self, path: &NodePath) -> Option<f64> {
        self.scores.get(path).map(|s| s.score)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Mean score, `None` when nothing was scored.
    pub fn mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.values().map(|s| s.score).sum::<f64>() / self.scores.len() as f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodePath, &ImportanceScore)> {
        self.scores.iter()
    }
}

// ── Filtering ─────────────────────────────────────────────────────────────

/// Keep what matters.
///
/// A branch scoring at least `threshold`, or flagged `systemCritical`, is
/// kept whole. Anything else is descended into, and whatever ends up empty
/// is pruned. Root-level scalars and lists are kept as they are; scalars
/// under a low-scoring branch are dropped. The result never contains a key
/// the input lacks.
pub fn filter_by_importance(context: &Node, scores: &ScoreTable, threshold: f64) -> Node {
    match context {
        Node::Branch(map) => Node::Branch(filter_map(map, &NodePath::root(), scores, threshold)),
        other => other.clone(),
    }
}

fn filter_map(
    map: &BTreeMap<String, Node>,
    path: &NodePath,
    scores: &ScoreTable,
    threshold: f64,
) -> BTreeMap<String, Node> {
    let mut kept = BTreeMap::new();
    for (key, value) in map {
        let retained = if path.is_root() && !value.is_branch() {
            Some(value.clone())
        } else {
            retain(value, &path.child(key), scores, threshold)
        };
        if let Some(node) = retained {
            kept.insert(key.clone(), node);
        }
    }
    kept
}

fn retain(node: &Node, path: &NodePath, scores: &ScoreTable, threshold: f64) -> Option<Node> {
    match node {
        Node::Branch(map) => {
            if node.flag("systemCritical") || scores.score(path).is_some_and(|s| s >= threshold) {
                return Some(node.clone());
            }
            let kept = filter_map(map, path, scores, threshold);
            (!kept.is_empty()).then_some(Node::Branch(kept))
        }
        Node::List(items) => {
            let kept: Vec<Node> = items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| retain(item, &path.index(i), scores, threshold))
                .collect();
            (!kept.is_empty()).then_some(Node::List(kept))
        }
        Node::Leaf(_) | Node::Ref(_) => None,
    }
}

// ── Aggressive restructuring ──────────────────────────────────────────────

/// Output of [`restructure`].
#[derive(Debug, Clone)]
pub struct Restructured {
    pub context: Node,
    /// Keys inside the buckets, excluding the bucket names themselves.
    pub bucketed_keys: usize,
}

/// Sort top-level entries into importance buckets and attach a checksummed
/// backup of the critical bucket. A non-branch context is returned as is.
pub fn restructure(context: &Node, scores: &ScoreTable) -> Result<Restructured, NodeError> {
    let Node::Branch(map) = context else {
        return Ok(Restructured {
            context: context.clone(),
            bucketed_keys: context.count_keys(),
        });
    };

    let mut buckets: [BTreeMap<String, Node>; 4] = Default::default();
    for (key, value) in map {
        let score = scores.score(&NodePath::root().child(key));
        let bucket = match score {
            _ if value.flag("systemCritical") => 0,
            Some(s) if s >= CRITICAL_BOUND => 0,
            Some(s) if s >= IMPORTANT_BOUND => 1,
            Some(s) if s >= STANDARD_BOUND => 2,
            None => 2,
            Some(_) => 3,
        };
        buckets[bucket].insert(key.clone(), value.clone());
    }

    let [critical, important, standard, low] = buckets.map(Node::Branch);
    let bucketed_keys = [&critical, &important, &standard, &low]
        .iter()
        .map(|b| b.count_keys())
        .sum();

    let mut backup = Node::empty_branch();
    backup.insert("checksum", Node::from(critical.checksum()?));
    backup.insert("data", critical.clone());

    let mut out = Node::empty_branch();
    for (name, bucket) in BUCKETS.into_iter().zip([critical, important, standard, low]) {
        out.insert(name, bucket);
    }
    out.insert("criticalBackup", backup);

    Ok(Restructured {
        context: out,
        bucketed_keys,
    })
}

/// `retained / original`, clamped to `[0, 1]`; `1.0` when there was nothing
/// to preserve.
pub fn preservation_rate(original_keys: usize, retained_keys: usize) -> f64 {
    if original_keys == 0 {
        return 1.0;
    }
    (retained_keys as f64 / original_keys as f64).clamp(0.0, 1.0)
}
