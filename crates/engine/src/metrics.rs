//! Running engine metrics and the feature log used for offline weight tuning.

use crate::scorer::FeatureVector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Snapshot returned by `ResilienceEngine::metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub total_resistances: u64,
    pub successful_resistances: u64,
    pub failed_resistances: u64,
    /// Incremental mean over successful passes.
    pub average_preservation_rate: f64,
    /// Ratio of the most recent compression.
    pub compression_ratio: f64,
    pub recovery_points: usize,
    pub cached_reconstructions: usize,
}

impl EngineMetrics {
    pub(crate) fn record_success(&mut self, preservation_rate: f64) {
        self.total_resistances += 1;
        self.successful_resistances += 1;
        self.average_preservation_rate += (preservation_rate - self.average_preservation_rate)
            / self.successful_resistances as f64;
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_resistances += 1;
        self.failed_resistances += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_resistances == 0 {
            return 0.0;
        }
        self.successful_resistances as f64 / self.total_resistances as f64
    }
}

/// One scored node, as exported for offline tuning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    /// Structural path of the node.
    pub id: String,
    pub features: FeatureVector,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded log; the oldest record is dropped first.
#[derive(Debug)]
pub(crate) struct FeatureLog {
    records: VecDeque<FeatureRecord>,
    capacity: usize,
}

impl FeatureLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, record: FeatureRecord) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<FeatureRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}
