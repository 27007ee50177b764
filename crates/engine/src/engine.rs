//! The resilience engine: public entry point tying scoring, compression,
//! reconstruction and recovery together.

use crate::classifier::{CriticalityClassifier, PatternClassifier};
use crate::compressor::{CompressOptions, CompressedState, Compressor, Decompressed};
use crate::metrics::{EngineMetrics, FeatureLog, FeatureRecord};
use crate::monitor::{MemoryMonitor, MemoryProbe, MonitorSettings, SysinfoProbe, memory_ratio};
use crate::reconstructor::{
    ReconstructOptions, ReconstructionResult, Reconstructor, RecoveryPointSummary,
};
use crate::scorer::{ImportanceScorer, PartialWeights, ScoringHints};
use crate::strategy::{ScoreTable, Strategy, filter_by_importance, preservation_rate, restructure};
use chrono::{DateTime, Utc};
use ctxguard_config::{EngineConfig, ResistanceLevel};
use ctxguard_core::{
    CompressionError, EngineEvent, EventBus, Node, NodePath, ReconstructionError, ResistError,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// ── Options and outcome ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ResistOptions {
    /// Skip automatic selection.
    pub strategy: Option<Strategy>,
    pub compress_critical: bool,
}

/// What a resistance pass did, under `metadata.resistance`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResistanceReport {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preservation_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub emergency: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_point: Option<String>,
    /// Compressed form of the retained context (filtering strategies).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed: Option<CompressedState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeMetadata {
    pub resistance: ResistanceReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResistOutcome {
    pub context: Node,
    pub metadata: OutcomeMetadata,
}

impl ResistOutcome {
    pub fn report(&self) -> &ResistanceReport {
        &self.metadata.resistance
    }
}

// ── Engine ────────────────────────────────────────────────────────────────

/// Owns every piece of mutable engine state. Share it as
/// `Arc<ResilienceEngine>`; all operations take `&self`.
pub struct ResilienceEngine {
    config: EngineConfig,
    scorer: ImportanceScorer,
    compressor: Arc<Compressor>,
    reconstructor: Reconstructor,
    probe: Arc<dyn MemoryProbe>,
    bus: EventBus,
    metrics: RwLock<EngineMetrics>,
    features: Mutex<FeatureLog>,
    monitor: Mutex<Option<MemoryMonitor>>,
}

impl ResilienceEngine {
    /// Build an engine with the pattern classifier described by `config`.
    pub fn new(config: EngineConfig) -> ctxguard_core::Result<Self> {
        let classifier = PatternClassifier::from_config(&config.classifier).map_err(|e| {
            ctxguard_core::Error::Config {
                message: format!("invalid classifier pattern: {e}"),
            }
        })?;
        Ok(Self::with_classifier(config, Arc::new(classifier)))
    }

    /// Build an engine around a caller-supplied classifier.
    pub fn with_classifier(config: EngineConfig, classifier: Arc<dyn CriticalityClassifier>) -> Self {
        let compressor = Arc::new(Compressor::new(classifier));
        let reconstructor = Reconstructor::new(
            Arc::clone(&compressor),
            config.cache_capacity,
            config.max_recovery_points,
        );
        Self {
            scorer: ImportanceScorer::from_config(&config.scoring),
            compressor,
            reconstructor,
            probe: Arc::new(SysinfoProbe::new()),
            bus: EventBus::new(config.event_capacity),
            metrics: RwLock::new(EngineMetrics::default()),
            features: Mutex::new(FeatureLog::new(config.feature_log_capacity)),
            monitor: Mutex::new(None),
            config,
        }
    }

    /// Replace the memory probe.
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Resistance ───────────────────────────────────────────────────────

    /// Score, transform and snapshot a context.
    ///
    /// With emergency recovery enabled a failed pass still returns `Ok`,
    /// carrying the emergency-protected context and `applied: false`.
    pub fn resist(&self, context: &Node, options: &ResistOptions) -> Result<ResistOutcome, ResistError> {
        let started = Instant::now();
        match self.run_resistance(context, options, started) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(error = %e, "resistance pass failed");
                self.metrics
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure();
                let emergency = self.config.enable_emergency_recovery;
                self.bus.publish(EngineEvent::ResistanceError {
                    error_message: e.to_string(),
                    emergency_applied: emergency,
                    timestamp: Utc::now(),
                });
                if !emergency {
                    return Err(e);
                }
                let mut outcome = self.emergency_protection(context, &e);
                outcome.metadata.resistance.duration_ms = elapsed_ms(started.elapsed());
                Ok(outcome)
            }
        }
    }

    fn run_resistance(
        &self,
        context: &Node,
        options: &ResistOptions,
        started: Instant,
    ) -> Result<ResistOutcome, ResistError> {
        let size_before = context.serialized_len()?;
        let scores = self.score_context(context);
        let strategy = options
            .strategy
            .unwrap_or_else(|| self.select_strategy(&scores));
        debug!(strategy = %strategy, scored = scores.len(), "strategy selected");

        let original_keys = context.count_keys();
        let (transformed, retained_keys, compressed) = match strategy.retention_threshold() {
            Some(threshold) => {
                let retained = filter_by_importance(context, &scores, threshold);
                let state = self.compressor.compress(
                    &retained,
                    &CompressOptions {
                        level: Some(strategy.compression_level()),
                        compress_critical: options.compress_critical,
                    },
                )?;
                let keys = retained.count_keys();
                (retained, keys, Some(state))
            }
            None => {
                let restructured = restructure(context, &scores)?;
                (restructured.context, restructured.bucketed_keys, None)
            }
        };

        let recovery_point = if self.config.enable_emergency_recovery {
            Some(self.reconstructor.create_recovery_point(&transformed)?)
        } else {
            None
        };

        let size_after = match &compressed {
            Some(state) => state.compressed_size,
            None => transformed.serialized_len()?,
        };
        let rate = preservation_rate(original_keys, retained_keys);
        let duration = started.elapsed();

        {
            let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            metrics.record_success(rate);
            metrics.compression_ratio = self.compressor.stats().last_ratio;
        }

        info!(
            strategy = %strategy,
            preservation_rate = rate,
            size_before,
            size_after,
            duration_ms = elapsed_ms(duration),
            "context resisted"
        );
        self.bus.publish(EngineEvent::Resistance {
            strategy: strategy.to_string(),
            preservation_rate: rate,
            duration_ms: elapsed_ms(duration),
            size_before,
            size_after,
            timestamp: Utc::now(),
        });

        Ok(ResistOutcome {
            context: transformed,
            metadata: OutcomeMetadata {
                resistance: ResistanceReport {
                    applied: true,
                    strategy: Some(strategy),
                    preservation_rate: Some(rate),
                    timestamp: Utc::now(),
                    duration_ms: elapsed_ms(duration),
                    emergency: false,
                    failed: false,
                    error: None,
                    recovery_point,
                    compressed,
                },
            },
        })
    }

    /// Score every branch below the root and log its features.
    pub fn score_context(&self, context: &Node) -> ScoreTable {
        let now = Utc::now();
        let depended = depended_upon(context);
        let mut table = ScoreTable::new();
        let mut records = Vec::new();

        context.visit_branches(&mut |path, node| {
            if path.is_root() {
                return;
            }
            let hints = ScoringHints {
                access_count: None,
                is_depended_upon: node.id().is_some_and(|id| depended.contains(&id)),
                path: path.clone(),
            };
            let score = self.scorer.calculate_score_at(node, &hints, now);
            records.push(FeatureRecord {
                id: path.to_string(),
                features: score.features.clone(),
                score: score.score,
                timestamp: now,
            });
            table.insert(path.clone(), score);
        });

        let mut log = self.features.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            log.push(record);
        }
        table
    }

    fn select_strategy(&self, scores: &ScoreTable) -> Strategy {
        if self.under_memory_pressure() {
            return Strategy::LowMemory;
        }
        if scores
            .mean()
            .is_some_and(|mean| mean > self.config.high_importance_threshold)
        {
            return Strategy::HighImportance;
        }
        match self.config.resistance_level {
            ResistanceLevel::Aggressive => Strategy::Aggressive,
            ResistanceLevel::Balanced => Strategy::Balanced,
        }
    }

    fn under_memory_pressure(&self) -> bool {
        memory_ratio(self.probe.as_ref(), self.config.memory_budget_bytes())
            .is_some_and(|(_, ratio)| ratio > self.config.memory_pressure_threshold)
    }

    /// Keep only `systemCritical` branches, keyed by path.
    ///
    /// Yields `{emergency: true, preserved: {...}}`, or `{failed: true}` when
    /// even the preserved branches cannot be serialized.
    pub fn emergency_protection(&self, context: &Node, cause: &ResistError) -> ResistOutcome {
        let mut kept: Vec<NodePath> = Vec::new();
        let mut preserved = BTreeMap::new();
        context.visit_branches(&mut |path, node| {
            if !node.flag("systemCritical")
                || kept.iter().any(|p| path.segments().starts_with(p.segments()))
            {
                return;
            }
            kept.push(path.clone());
            preserved.insert(path.to_string(), node.clone());
        });

        let mut protected = Node::empty_branch();
        protected.insert("emergency", Node::from(true));
        protected.insert("preserved", Node::Branch(preserved));

        let failed = match protected.to_json() {
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "emergency protection could not preserve critical data");
                true
            }
        };
        let context = if failed {
            let mut stub = Node::empty_branch();
            stub.insert("failed", Node::from(true));
            stub
        } else {
            warn!(preserved = kept.len(), "emergency protection applied");
            protected
        };

        ResistOutcome {
            context,
            metadata: OutcomeMetadata {
                resistance: ResistanceReport {
                    applied: false,
                    strategy: None,
                    preservation_rate: None,
                    timestamp: Utc::now(),
                    duration_ms: 0,
                    emergency: !failed,
                    failed,
                    error: Some(cause.to_string()),
                    recovery_point: None,
                    compressed: None,
                },
            },
        }
    }

    // ── Delegated operations ─────────────────────────────────────────────

    pub fn compress(
        &self,
        context: &Node,
        options: &CompressOptions,
    ) -> Result<CompressedState, CompressionError> {
        self.compressor.compress(context, options)
    }

    pub fn decompress(&self, state: &CompressedState) -> Node {
        self.compressor.decompress(state)
    }

    pub fn decompress_with_report(&self, state: &CompressedState) -> Decompressed {
        self.compressor.decompress_with_report(state)
    }

    pub fn decompress_strict(&self, state: &CompressedState) -> Result<Node, CompressionError> {
        self.compressor.decompress_strict(state)
    }

    pub fn reconstruct(&self, snapshot: &Node, options: &ReconstructOptions) -> ReconstructionResult {
        self.reconstructor.reconstruct(snapshot, options)
    }

    pub fn create_recovery_point(&self, context: &Node) -> Result<String, ReconstructionError> {
        self.reconstructor.create_recovery_point(context)
    }

    pub fn emergency_recovery(&self, state: &Node, error: &str) -> ReconstructionResult {
        self.reconstructor.emergency_recovery(state, error)
    }

    pub fn recovery_points(&self) -> Vec<RecoveryPointSummary> {
        self.reconstructor.recovery_points()
    }

    pub fn restore_point(&self, id: &str) -> Result<Node, ReconstructionError> {
        self.reconstructor.restore_point(id)
    }

    pub fn update_weights(&self, partial: &PartialWeights) {
        self.scorer.update_weights(partial);
    }

    // ── Observability ────────────────────────────────────────────────────

    pub fn metrics(&self) -> EngineMetrics {
        let mut snapshot = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        snapshot.compression_ratio = self.compressor.stats().last_ratio;
        snapshot.recovery_points = self.reconstructor.recovery_points().len();
        snapshot.cached_reconstructions = self.reconstructor.cache_len();
        snapshot
    }

    /// Every logged feature record, oldest first.
    pub fn export_ml_features(&self) -> Vec<FeatureRecord> {
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EngineEvent>> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start the background memory monitor on the current tokio runtime.
    ///
    /// Returns whether a monitor is running afterwards.
    pub fn start_memory_monitor(&self) -> bool {
        if !self.config.monitor.enabled {
            return false;
        }
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(MemoryMonitor::is_running) {
            return true;
        }
        let settings = MonitorSettings {
            budget_bytes: self.config.memory_budget_bytes(),
            pressure_ratio: self.config.monitor.pressure_ratio,
            interval: Duration::from_secs(self.config.monitor.interval_secs.max(1)),
        };
        *slot = MemoryMonitor::spawn(Arc::clone(&self.probe), self.bus.clone(), settings);
        slot.is_some()
    }

    /// Stop the monitor and drop recovery points, cache and feature log.
    pub fn cleanup(&self) {
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.stop();
        }
        self.reconstructor.clear();
        self.features
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("engine state cleared");
    }
}

impl Default for ResilienceEngine {
    fn default() -> Self {
        Self::with_classifier(EngineConfig::default(), Arc::new(PatternClassifier::new()))
    }
}

/// Ids listed in any `dependencies` list of the tree.
fn depended_upon(context: &Node) -> HashSet<String> {
    let mut ids = HashSet::new();
    context.visit_branches(&mut |_, node| ids.extend(node.dependencies()));
    ids
}

fn elapsed_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
