//! Shielded compression.
//!
//! A context is split into a `critical` part, which is kept verbatim, and a
//! `nonCritical` part whose top-level entries are deflated and base64
//! encoded. Decompression decodes what it can and merges the critical part
//! back over the result.
//!
//! # Decode policy
//!
//! An entry that fails to decode is passed through unchanged rather than
//! treated as an error. [`Compressor::decompress_with_report`] says which
//! entries were decoded and which were passed through raw;
//! [`Compressor::decompress_strict`] turns any pass-through into
//! [`CompressionError::Corrupted`].

use crate::classifier::{CriticalityClassifier, PatternClassifier};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ctxguard_core::{CompressionError, Node, NodeError, NodePath, ReconstructionError};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

const LIGHT_LIMIT: usize = 1024;
const MODERATE_LIMIT: usize = 10 * 1024;
const HEAVY_LIMIT: usize = 100 * 1024;

/// Name recorded in [`CompressionMetadata::algorithm`].
pub const ALGORITHM: &str = "deflate+base64";

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    None,
    Light,
    Moderate,
    Heavy,
}

impl CompressionLevel {
    /// Level picked for a serialized size in bytes.
    pub fn for_size(bytes: usize) -> Self {
        match bytes {
            b if b < LIGHT_LIMIT => Self::None,
            b if b < MODERATE_LIMIT => Self::Light,
            b if b < HEAVY_LIMIT => Self::Moderate,
            _ => Self::Heavy,
        }
    }

    fn deflate(self) -> Compression {
        match self {
            Self::None => Compression::none(),
            Self::Light => Compression::fast(),
            Self::Moderate => Compression::default(),
            Self::Heavy => Compression::best(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
        }
    }
}

impl std::fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "light" | "1" => Ok(Self::Light),
            "moderate" | "2" => Ok(Self::Moderate),
            "heavy" | "3" => Ok(Self::Heavy),
            other => Err(format!("unknown compression level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    /// Overrides the size-based level.
    pub level: Option<CompressionLevel>,
    /// Also encode the critical part (always at [`CompressionLevel::Light`]).
    pub compress_critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionMetadata {
    pub timestamp: DateTime<Utc>,
    pub algorithm: String,
    pub critical_compressed: bool,
}

/// Output of [`Compressor::compress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedState {
    pub compressed: bool,
    pub original_size: usize,
    pub compressed_size: usize,
    /// `1 - compressed_size / original_size`; negative when encoding grew
    /// the data.
    pub compression_ratio: f64,
    pub level: CompressionLevel,
    pub critical: Node,
    pub non_critical: Node,
    pub metadata: CompressionMetadata,
}

impl CompressedState {
    /// The state as an ordinary context tree.
    pub fn to_node(&self) -> Result<Node, NodeError> {
        serde_json::to_value(self)
            .map(Node::from)
            .map_err(|e| NodeError::Encoding(e.to_string()))
    }

    /// Parse a context tree produced by [`CompressedState::to_node`].
    pub fn from_node(node: &Node) -> Result<Self, ReconstructionError> {
        let value = node.to_json()?;
        let state: Self = serde_json::from_value(value)
            .map_err(|e| ReconstructionError::MalformedSnapshot(e.to_string()))?;
        if !state.compressed {
            return Err(ReconstructionError::MalformedSnapshot(
                "compressed flag is false".into(),
            ));
        }
        Ok(state)
    }

    /// Whether a tree looks like a compressed envelope.
    pub fn is_envelope(node: &Node) -> bool {
        node.flag("compressed") && node.get("nonCritical").is_some()
    }
}

/// Which entries were decoded and which were passed through raw.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodeReport {
    pub decoded: Vec<String>,
    pub passed_through: Vec<String>,
}

impl DecodeReport {
    pub fn is_clean(&self) -> bool {
        self.passed_through.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Decompressed {
    pub context: Node,
    pub report: DecodeReport,
}

/// Running aggregate over every compression attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub total_compressed: u64,
    /// Incremental mean of the compression ratio.
    pub average_ratio: f64,
    pub last_ratio: f64,
    pub failures: u64,
}

// ── Compressor ────────────────────────────────────────────────────────────

pub struct Compressor {
    classifier: Arc<dyn CriticalityClassifier>,
    stats: RwLock<CompressionStats>,
}

impl Compressor {
    pub fn new(classifier: Arc<dyn CriticalityClassifier>) -> Self {
        Self {
            classifier,
            stats: RwLock::new(CompressionStats::default()),
        }
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Compress a context, shielding critical fragments.
    pub fn compress(
        &self,
        context: &Node,
        options: &CompressOptions,
    ) -> Result<CompressedState, CompressionError> {
        match self.try_compress(context, options) {
            Ok(state) => {
                self.record_success(state.compression_ratio);
                Ok(state)
            }
            Err(e) => {
                self.stats
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .failures += 1;
                warn!(error = %e, "compression failed");
                Err(e)
            }
        }
    }

    fn try_compress(
        &self,
        context: &Node,
        options: &CompressOptions,
    ) -> Result<CompressedState, CompressionError> {
        // Expanding references up front both detects cycles and makes each
        // partition self-contained.
        let plain = context.to_json()?;
        let original_size = serde_json::to_string(&plain)
            .map_err(|e| NodeError::Encoding(e.to_string()))?
            .len();
        let plain = Node::from(plain);

        let level = options
            .level
            .unwrap_or_else(|| CompressionLevel::for_size(original_size));

        let (critical, non_critical) = match &plain {
            Node::Branch(map) => {
                let (critical, rest) = self.partition(map, &NodePath::root());
                (Node::Branch(critical), Node::Branch(rest))
            }
            other => (Node::empty_branch(), other.clone()),
        };

        let non_critical = encode_entries(non_critical, level)?;
        let critical = if options.compress_critical {
            encode_entries(critical, CompressionLevel::Light)?
        } else {
            critical
        };

        let compressed_size = critical.serialized_len()? + non_critical.serialized_len()?;
        let compression_ratio = if original_size == 0 {
            0.0
        } else {
            1.0 - compressed_size as f64 / original_size as f64
        };

        debug!(
            level = %level,
            original_size,
            compressed_size,
            compression_ratio,
            "context compressed"
        );

        Ok(CompressedState {
            compressed: true,
            original_size,
            compressed_size,
            compression_ratio,
            level,
            critical,
            non_critical,
            metadata: CompressionMetadata {
                timestamp: Utc::now(),
                algorithm: ALGORITHM.to_string(),
                critical_compressed: options.compress_critical,
            },
        })
    }

    /// Split `map` by the classifier, descending into nested mappings only.
    /// A list is classified as a whole: critical fields inside list items
    /// are not shielded and travel with the rest.
    fn partition(
        &self,
        map: &BTreeMap<String, Node>,
        path: &NodePath,
    ) -> (BTreeMap<String, Node>, BTreeMap<String, Node>) {
        let mut critical = BTreeMap::new();
        let mut rest = BTreeMap::new();

        for (key, value) in map {
            let child_path = path.child(key);
            if self.classifier.is_critical(key, &child_path, value) {
                critical.insert(key.clone(), value.clone());
                continue;
            }
            match value {
                Node::Branch(sub) if !sub.is_empty() => {
                    let (sub_critical, sub_rest) = self.partition(sub, &child_path);
                    if !sub_critical.is_empty() {
                        critical.insert(key.clone(), Node::Branch(sub_critical));
                    }
                    if !sub_rest.is_empty() {
                        rest.insert(key.clone(), Node::Branch(sub_rest));
                    }
                }
                _ => {
                    rest.insert(key.clone(), value.clone());
                }
            }
        }

        (critical, rest)
    }

    fn record_success(&self, ratio: f64) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.total_compressed += 1;
        stats.average_ratio += (ratio - stats.average_ratio) / stats.total_compressed as f64;
        stats.last_ratio = ratio;
    }

    /// Restore the original context. Undecodable entries pass through.
    pub fn decompress(&self, state: &CompressedState) -> Node {
        self.decompress_with_report(state).context
    }

    /// Like [`Compressor::decompress`], also reporting pass-throughs.
    pub fn decompress_with_report(&self, state: &CompressedState) -> Decompressed {
        let mut report = DecodeReport::default();
        let rest = decode_entries(
            &state.non_critical,
            state.level != CompressionLevel::None,
            "nonCritical",
            &mut report,
        );
        let critical = decode_entries(
            &state.critical,
            state.metadata.critical_compressed,
            "critical",
            &mut report,
        );

        if !report.is_clean() {
            warn!(
                entries = ?report.passed_through,
                "compressed entries failed to decode, passing through raw"
            );
        }

        Decompressed {
            context: merge(rest, critical),
            report,
        }
    }

    /// Decompress, refusing any entry that did not decode.
    pub fn decompress_strict(&self, state: &CompressedState) -> Result<Node, CompressionError> {
        let Decompressed { context, report } = self.decompress_with_report(state);
        if report.is_clean() {
            Ok(context)
        } else {
            Err(CompressionError::Corrupted {
                paths: report.passed_through,
            })
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(Arc::new(PatternClassifier::new()))
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────

fn encode_entries(node: Node, level: CompressionLevel) -> Result<Node, CompressionError> {
    if level == CompressionLevel::None {
        return Ok(node);
    }
    match node {
        Node::Branch(map) => map
            .into_iter()
            .map(|(key, value)| -> Result<(String, Node), CompressionError> {
                let blob = encode(&value, level).map_err(|reason| CompressionError::Encode {
                    path: key.clone(),
                    reason,
                })?;
                Ok((key, Node::from(blob)))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Node::Branch),
        other => encode(&other, level)
            .map(Node::from)
            .map_err(|reason| CompressionError::Encode {
                path: "$".into(),
                reason,
            }),
    }
}

fn encode(node: &Node, level: CompressionLevel) -> Result<String, String> {
    let text = node.to_json_string().map_err(|e| e.to_string())?;
    let mut encoder = DeflateEncoder::new(Vec::new(), level.deflate());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| e.to_string())?;
    let bytes = encoder.finish().map_err(|e| e.to_string())?;
    Ok(STANDARD.encode(bytes))
}

fn decode(blob: &str) -> Option<Node> {
    let bytes = STANDARD.decode(blob).ok()?;
    let mut decoder = DeflateDecoder::new(bytes.as_slice());
    let mut text = Vec::new();
    decoder.read_to_end(&mut text).ok()?;
    serde_json::from_slice::<serde_json::Value>(&text)
        .ok()
        .map(Node::from)
}

fn decode_entries(node: &Node, encoded: bool, label: &str, report: &mut DecodeReport) -> Node {
    if !encoded {
        return node.clone();
    }
    let mut attempt = |path: String, value: &Node| match value.as_str().and_then(decode) {
        Some(decoded) => {
            report.decoded.push(path);
            decoded
        }
        None => {
            report.passed_through.push(path);
            value.clone()
        }
    };
    match node {
        Node::Branch(map) => Node::Branch(
            map.iter()
                .map(|(key, value)| (key.clone(), attempt(format!("{label}.{key}"), value)))
                .collect(),
        ),
        other => attempt(label.to_string(), other),
    }
}

/// Deep-merge `overlay` onto `base`; overlay wins at the same path.
fn merge(base: Node, overlay: Node) -> Node {
    match (base, overlay) {
        (base, Node::Branch(over)) if over.is_empty() => base,
        (Node::Branch(mut base), Node::Branch(over)) => {
            for (key, value) in over {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Node::Branch(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compressor() -> Compressor {
        Compressor::default()
    }

    fn opts(level: CompressionLevel) -> CompressOptions {
        CompressOptions {
            level: Some(level),
            compress_critical: false,
        }
    }

    fn large_context(entries: usize) -> Node {
        let mut map = serde_json::Map::new();
        for i in 0..entries {
            map.insert(
                format!("turn_{i}"),
                json!({"role": "user", "text": "lorem ipsum dolor sit amet ".repeat(4)}),
            );
        }
        Node::from(serde_json::Value::Object(map))
    }

    #[test]
    fn critical_fields_are_shielded() {
        let context = Node::from(json!({"a": {"password": "p1"}, "b": {"value": "v"}}));
        let state = compressor()
            .compress(&context, &opts(CompressionLevel::Light))
            .unwrap();

        let password = state
            .critical
            .get("a")
            .and_then(|a| a.get("password"))
            .and_then(Node::as_str);
        assert_eq!(password, Some("p1"));
        assert!(state.non_critical.get("b").and_then(Node::as_str).is_some());
        assert!(state.non_critical.get("a").is_none());
        assert_eq!(compressor().decompress(&state), context);
    }

    #[test]
    fn list_items_travel_with_the_rest() {
        let context = Node::from(json!({"history": [{"token": "t"}], "b": {"value": "v"}}));
        let state = compressor()
            .compress(&context, &opts(CompressionLevel::Light))
            .unwrap();

        assert!(state.critical.get("history").is_none());
        assert!(state.non_critical.get("history").is_some());
        assert_eq!(compressor().decompress(&state), context);
    }

    #[test]
    fn small_inputs_are_not_encoded_by_default() {
        let context = Node::from(json!({"a": {"password": "p1"}, "b": {"value": "v"}}));
        let state = compressor()
            .compress(&context, &CompressOptions::default())
            .unwrap();
        assert_eq!(state.level, CompressionLevel::None);
        assert_eq!(
            state.non_critical,
            Node::from(json!({"b": {"value": "v"}}))
        );
    }

    #[test]
    fn roundtrip_preserves_context() {
        let c = compressor();
        let contexts = [
            Node::from(json!({})),
            Node::from(json!("just a string")),
            Node::from(json!([1, 2, {"token": "t"}])),
            Node::from(json!({
                "session": {"id": "s1", "auth": {"user": "u"}, "turns": [1, 2, 3], "empty": {}},
                "notes": {"pinned": {"systemCritical": true, "text": "keep"}, "misc": null},
                "apiKey": "k"
            })),
            large_context(40),
        ];
        for context in contexts {
            for level in [None, Some(CompressionLevel::Light), Some(CompressionLevel::Heavy)] {
                let state = c
                    .compress(&context, &CompressOptions { level, compress_critical: false })
                    .unwrap();
                assert_eq!(c.decompress(&state), context);
            }
        }
    }

    #[test]
    fn level_follows_size_thresholds() {
        assert_eq!(CompressionLevel::for_size(10), CompressionLevel::None);
        assert_eq!(CompressionLevel::for_size(1024), CompressionLevel::Light);
        assert_eq!(CompressionLevel::for_size(50 * 1024), CompressionLevel::Moderate);
        assert_eq!(CompressionLevel::for_size(100 * 1024), CompressionLevel::Heavy);

        let state = compressor()
            .compress(&large_context(40), &CompressOptions::default())
            .unwrap();
        assert_eq!(state.level, CompressionLevel::Light);
        assert!(state.compression_ratio > 0.0);
    }

    #[test]
    fn ratio_matches_sizes() {
        let state = compressor()
            .compress(&large_context(10), &opts(CompressionLevel::Moderate))
            .unwrap();
        let expected = 1.0 - state.compressed_size as f64 / state.original_size as f64;
        assert!((state.compression_ratio - expected).abs() < 1e-12);
    }

    #[test]
    fn tiny_inputs_can_have_negative_ratio() {
        let state = compressor()
            .compress(&Node::from(json!({"a": 1})), &opts(CompressionLevel::Heavy))
            .unwrap();
        assert!(state.compression_ratio < 0.0);
    }

    #[test]
    fn compress_critical_uses_light_level() {
        let context = Node::from(json!({"secret": {"v": "s".repeat(200)}, "x": 1}));
        let state = compressor()
            .compress(
                &context,
                &CompressOptions {
                    level: Some(CompressionLevel::Heavy),
                    compress_critical: true,
                },
            )
            .unwrap();
        let blob = state.critical.get("secret").and_then(Node::as_str).unwrap();
        assert_eq!(decode(blob), context.get("secret").cloned());
        assert_eq!(Some(blob.to_string()), encode(context.get("secret").unwrap(), CompressionLevel::Light).ok());
        assert!(state.metadata.critical_compressed);
        assert_eq!(compressor().decompress(&state), context);
    }

    #[test]
    fn circular_input_fails_and_counts() {
        let c = compressor();
        let mut context = Node::from(json!({"id": "root"}));
        context.insert("me", Node::Ref("root".into()));
        let err = c.compress(&context, &CompressOptions::default()).unwrap_err();
        assert!(matches!(err, CompressionError::Serialization(NodeError::CircularReference { .. })));
        assert_eq!(c.stats().failures, 1);
        assert_eq!(c.stats().total_compressed, 0);
    }

    #[test]
    fn references_are_expanded() {
        let mut context = Node::from(json!({"a": {"id": "a", "v": 1}}));
        context.insert("b", Node::Ref("a".into()));
        let c = compressor();
        let state = c.compress(&context, &opts(CompressionLevel::Light)).unwrap();
        assert_eq!(
            c.decompress(&state),
            Node::from(json!({"a": {"id": "a", "v": 1}, "b": {"id": "a", "v": 1}}))
        );
    }

    #[test]
    fn corrupted_entries_pass_through_with_report() {
        let c = compressor();
        let context = Node::from(json!({"a": {"x": 1}, "b": {"y": 2}}));
        let mut state = c.compress(&context, &opts(CompressionLevel::Light)).unwrap();
        state.non_critical.insert("b", Node::from("%%% not base64 %%%"));

        let Decompressed { context: out, report } = c.decompress_with_report(&state);
        assert_eq!(out.get("a"), context.get("a"));
        assert_eq!(out.get("b").and_then(Node::as_str), Some("%%% not base64 %%%"));
        assert_eq!(report.decoded, vec!["nonCritical.a"]);
        assert_eq!(report.passed_through, vec!["nonCritical.b"]);

        let err = c.decompress_strict(&state).unwrap_err();
        assert!(matches!(err, CompressionError::Corrupted { ref paths } if paths == &["nonCritical.b"]));
    }

    #[test]
    fn stats_track_incremental_mean() {
        let c = compressor();
        let a = c.compress(&large_context(10), &opts(CompressionLevel::Heavy)).unwrap();
        let b = c.compress(&Node::from(json!({"a": 1})), &opts(CompressionLevel::Heavy)).unwrap();
        let stats = c.stats();
        assert_eq!(stats.total_compressed, 2);
        let mean = (a.compression_ratio + b.compression_ratio) / 2.0;
        assert!((stats.average_ratio - mean).abs() < 1e-12);
        assert_eq!(stats.last_ratio, b.compression_ratio);
    }

    #[test]
    fn state_travels_as_node() {
        let c = compressor();
        let context = large_context(5);
        let state = c.compress(&context, &opts(CompressionLevel::Moderate)).unwrap();
        let node = state.to_node().unwrap();
        assert!(CompressedState::is_envelope(&node));
        let parsed = CompressedState::from_node(&node).unwrap();
        assert_eq!(c.decompress(&parsed), context);
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        let node = Node::from(json!({"compressed": true, "nonCritical": {}}));
        assert!(matches!(
            CompressedState::from_node(&node),
            Err(ReconstructionError::MalformedSnapshot(_))
        ));
    }

    #[test]
    fn level_parses_from_text() {
        assert_eq!("Heavy".parse::<CompressionLevel>(), Ok(CompressionLevel::Heavy));
        assert_eq!("1".parse::<CompressionLevel>(), Ok(CompressionLevel::Light));
        assert!("max".parse::<CompressionLevel>().is_err());
    }
}
