//! # ctxguard Engine
//!
//! Keeps agent context alive under pressure. The engine scores every
//! branch of a context, compresses it while shielding sensitive fragments,
//! reconstructs it from compressed or damaged snapshots, and falls back
//! through recovery points, salvage and a minimal stub when all else fails.
//!
//! ```text
//! context ──► ImportanceScorer ──► strategy ──► filter / restructure
//!                                                   │
//!                      Compressor ◄─────────────────┘
//!                          │
//!                  recovery point ──► ResistOutcome
//! ```

pub mod classifier;
pub mod compressor;
pub mod engine;
pub mod metrics;
pub mod monitor;
pub mod reconstructor;
pub mod scorer;
pub mod strategy;

pub use classifier::{CriticalityClassifier, PatternClassifier, SENSITIVE_NAMES};
pub use compressor::{
    CompressOptions, CompressedState, CompressionLevel, CompressionStats, Compressor,
    DecodeReport, Decompressed,
};
pub use engine::{ResilienceEngine, ResistOptions, ResistOutcome, ResistanceReport};
pub use metrics::{EngineMetrics, FeatureRecord};
pub use monitor::{FixedProbe, MemoryMonitor, MemoryProbe, SysinfoProbe};
pub use reconstructor::{
    ReconstructOptions, ReconstructionResult, Reconstructor, RecoveryMethod, RecoveryPoint,
    RecoveryPointSummary,
};
pub use scorer::{
    FeatureVector, ImportanceScore, ImportanceScorer, PartialWeights, ScoreWeights, ScoringHints,
};
pub use strategy::{ScoreTable, Strategy, filter_by_importance};
