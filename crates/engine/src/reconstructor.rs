//! Reconstruction and tiered disaster recovery.
//!
//! [`Reconstructor::reconstruct`] never fails: anything that goes wrong while
//! decoding a snapshot is routed to [`Reconstructor::emergency_recovery`],
//! which cascades through recovery points, salvage and finally a minimal
//! stub context.

use crate::compressor::{CompressedState, Compressor, DecodeReport};
use chrono::{DateTime, Utc};
use ctxguard_core::{MAX_DEPTH, Node, NodePath, ReconstructionError, Scalar};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Version stamped into restored metadata when none is present.
pub const METADATA_VERSION: &str = "1.0.0";

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconstructOptions {
    pub skip_cache: bool,
}

/// Which emergency tier produced a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    RecoveryPoint,
    Salvage,
    Minimal,
}

impl RecoveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecoveryPoint => "recovery_point",
            Self::Salvage => "salvage",
            Self::Minimal => "minimal",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconstructionResult {
    pub context: Node,
    #[serde(rename = "reconstructionTimeMs", serialize_with = "millis")]
    pub reconstruction_time: Duration,
    pub success: bool,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_method: Option<RecoveryMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

fn millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// A verified snapshot of a context.
#[derive(Debug, Clone)]
pub struct RecoveryPoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub context: Node,
    /// Lowercase hex SHA-256 of the serialized context at creation.
    pub checksum: String,
}

impl RecoveryPoint {
    /// Re-hash the stored context and compare with the recorded checksum.
    pub fn verify(&self) -> bool {
        self.context
            .checksum()
            .is_ok_and(|fresh| fresh == self.checksum)
    }
}

/// Listing entry for a recovery point, without the context itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPointSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

/// A finished reconstruction together with what went wrong along the way.
#[derive(Debug, Clone, PartialEq)]
struct Reconstructed {
    context: Node,
    report: DecodeReport,
    issues: Vec<String>,
}

/// Bounded memo keyed by snapshot checksum. Oldest insertion is evicted first.
struct ReconstructionCache {
    entries: HashMap<String, Reconstructed>,
    order: VecDeque<String>,
    capacity: usize,
}

impl ReconstructionCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<Reconstructed> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, done: Reconstructed) {
        if self.entries.insert(key.clone(), done).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

// ── Reconstructor ─────────────────────────────────────────────────────────

pub struct Reconstructor {
    compressor: Arc<Compressor>,
    cache: Mutex<ReconstructionCache>,
    points: RwLock<VecDeque<RecoveryPoint>>,
    max_points: usize,
}

impl Reconstructor {
    pub fn new(compressor: Arc<Compressor>, cache_capacity: usize, max_points: usize) -> Self {
        Self {
            compressor,
            cache: Mutex::new(ReconstructionCache::new(cache_capacity)),
            points: RwLock::new(VecDeque::new()),
            max_points: max_points.max(1),
        }
    }

    /// Rebuild a usable context from a snapshot. Never fails.
    pub fn reconstruct(&self, snapshot: &Node, options: &ReconstructOptions) -> ReconstructionResult {
        let started = Instant::now();
        match self.try_reconstruct(snapshot, options) {
            Ok((done, cache_hit)) => {
                let warning = if !done.report.is_clean() {
                    Some(format!(
                        "{} compressed entries could not be decoded",
                        done.report.passed_through.len()
                    ))
                } else if !done.issues.is_empty() {
                    Some("metadata could not be restored".to_string())
                } else {
                    None
                };
                let mut errors = done.report.passed_through;
                errors.extend(done.issues);
                ReconstructionResult {
                    context: done.context,
                    reconstruction_time: started.elapsed(),
                    success: true,
                    cache_hit,
                    recovery_method: None,
                    warning,
                    errors,
                }
            }
            Err(e) => {
                warn!(error = %e, "reconstruction failed, starting emergency recovery");
                let mut result = self.emergency_recovery(snapshot, &e.to_string());
                result.reconstruction_time = started.elapsed();
                result
            }
        }
    }

    fn try_reconstruct(
        &self,
        snapshot: &Node,
        options: &ReconstructOptions,
    ) -> Result<(Reconstructed, bool), ReconstructionError> {
        let key = snapshot.checksum()?;

        if !options.skip_cache {
            let cached = self
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key);
            if let Some(done) = cached {
                debug!(key = %key, "reconstruction cache hit");
                return Ok((done, true));
            }
        }

        let (mut context, report) = if snapshot.flag("compressed") {
            let state = CompressedState::from_node(snapshot)?;
            let decoded = self.compressor.decompress_with_report(&state);
            (decoded.context, decoded.report)
        } else {
            (snapshot.clone(), DecodeReport::default())
        };

        let linked = rebuild_relationships(&mut context);
        let mut issues = Vec::new();
        if let Err(issue) = restore_metadata(&mut context, Utc::now()) {
            warn!(issue, "metadata defaults skipped");
            issues.push(issue.to_string());
        }
        let problems = validate(&mut context);
        debug!(linked, problems, "context reconstructed");

        let done = Reconstructed {
            context,
            report,
            issues,
        };
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, done.clone());

        Ok((done, false))
    }

    // ── Recovery points ──────────────────────────────────────────────────

    /// Snapshot a context. Returns the new point's id.
    pub fn create_recovery_point(&self, context: &Node) -> Result<String, ReconstructionError> {
        let checksum = context.checksum()?;
        let point = RecoveryPoint {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            context: context.clone(),
            checksum,
        };
        let id = point.id.clone();

        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        points.push_back(point);
        while points.len() > self.max_points {
            points.pop_front();
        }
        debug!(id = %id, stored = points.len(), "recovery point created");
        Ok(id)
    }

    /// Oldest first.
    pub fn recovery_points(&self) -> Vec<RecoveryPointSummary> {
        self.points
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| RecoveryPointSummary {
                id: p.id.clone(),
                timestamp: p.timestamp,
                checksum: p.checksum.clone(),
            })
            .collect()
    }

    /// Verified copy of a specific recovery point.
    pub fn restore_point(&self, id: &str) -> Result<Node, ReconstructionError> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let point = points
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ReconstructionError::PointNotFound(id.to_string()))?;
        if !point.verify() {
            return Err(ReconstructionError::ChecksumMismatch { id: point.id.clone() });
        }
        Ok(point.context.clone())
    }

    /// Drop every recovery point and cached reconstruction.
    pub fn clear(&self) {
        self.points
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ── Emergency recovery ───────────────────────────────────────────────

    /// Recover something usable from `state`. Never fails.
    pub fn emergency_recovery(&self, state: &Node, error: &str) -> ReconstructionResult {
        let started = Instant::now();
        let mut errors = vec![error.to_string()];

        match self.recover_from_points(state) {
            Ok(context) => {
                info!("emergency recovery restored a recovery point");
                return ReconstructionResult {
                    context,
                    reconstruction_time: started.elapsed(),
                    success: true,
                    cache_hit: false,
                    recovery_method: Some(RecoveryMethod::RecoveryPoint),
                    warning: None,
                    errors,
                };
            }
            Err(e) => {
                debug!(error = %e, "no usable recovery point");
                errors.push(e.to_string());
            }
        }

        match salvage(state) {
            Ok(context) => {
                warn!("emergency recovery salvaged a partial context");
                return ReconstructionResult {
                    context,
                    reconstruction_time: started.elapsed(),
                    success: false,
                    cache_hit: false,
                    recovery_method: Some(RecoveryMethod::Salvage),
                    warning: Some("data loss likely".into()),
                    errors,
                };
            }
            Err(e) => {
                debug!(error = %e, "salvage failed");
                errors.push(e.to_string());
            }
        }

        warn!("emergency recovery fell back to a minimal context");
        ReconstructionResult {
            context: minimal_context(Utc::now()),
            reconstruction_time: started.elapsed(),
            success: false,
            cache_hit: false,
            recovery_method: Some(RecoveryMethod::Minimal),
            warning: Some("minimal context only, original data lost".into()),
            errors,
        }
    }

    fn recover_from_points(&self, state: &Node) -> Result<Node, ReconstructionError> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        let wanted = state.checksum().ok();
        let point = wanted
            .and_then(|sum| points.iter().rev().find(|p| p.checksum == sum))
            .or_else(|| points.back())
            .ok_or_else(|| ReconstructionError::PointNotFound("no recovery points stored".into()))?;

        if !point.verify() {
            warn!(id = %point.id, "recovery point is corrupted");
            return Err(ReconstructionError::ChecksumMismatch { id: point.id.clone() });
        }
        Ok(point.context.clone())
    }
}

impl Default for Reconstructor {
    fn default() -> Self {
        Self::new(Arc::new(Compressor::default()), 100, 10)
    }
}

// ── Reconstruction steps ──────────────────────────────────────────────────

fn scalar_id(node: &Node) -> Option<String> {
    match node {
        Node::Leaf(Scalar::String(s)) => Some(s.clone()),
        Node::Leaf(Scalar::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn resolvable `dependencies` entries and `parentId` fields into
/// references. Returns how many references were created.
fn rebuild_relationships(context: &mut Node) -> usize {
    let ids = context.id_table();
    if ids.is_empty() {
        return 0;
    }
    link(context, &ids)
}

fn link(node: &mut Node, ids: &HashMap<String, NodePath>) -> usize {
    match node {
        Node::Branch(map) => {
            let mut linked = 0;
            if let Some(Node::List(deps)) = map.get_mut("dependencies") {
                for dep in deps.iter_mut() {
                    if let Some(id) = scalar_id(dep).filter(|id| ids.contains_key(id)) {
                        *dep = Node::Ref(id);
                        linked += 1;
                    }
                }
            }
            let parent = map
                .get("parentId")
                .and_then(scalar_id)
                .filter(|id| ids.contains_key(id));
            if let Some(id) = parent {
                map.insert("parent".into(), Node::Ref(id));
                linked += 1;
            }
            linked
                + map
                    .iter_mut()
                    .filter(|(key, _)| key.as_str() != "dependencies" && key.as_str() != "parent")
                    .map(|(_, child)| link(child, ids))
                    .sum::<usize>()
        }
        Node::List(items) => items.iter_mut().map(|item| link(item, ids)).sum(),
        Node::Leaf(_) | Node::Ref(_) => 0,
    }
}

/// Fill in missing metadata defaults. Non-mapping roots carry no metadata.
fn restore_metadata(context: &mut Node, now: DateTime<Utc>) -> Result<(), &'static str> {
    let Some(map) = context.as_branch_mut() else {
        return Ok(());
    };
    let metadata = map
        .entry("metadata".to_string())
        .or_insert_with(Node::empty_branch);
    let Some(meta) = metadata.as_branch_mut() else {
        return Err("metadata is not a mapping");
    };

    let stamp = now.to_rfc3339();
    meta.entry("created".into())
        .or_insert_with(|| Node::from(stamp.as_str()));
    meta.entry("lastModified".into())
        .or_insert_with(|| Node::from(stamp.as_str()));
    meta.entry("version".into())
        .or_insert_with(|| Node::from(METADATA_VERSION));

    let system = meta
        .entry("system".into())
        .or_insert_with(Node::empty_branch);
    system.insert("reconstructed", Node::from(true));
    Ok(())
}

/// Record problems under `metadata.validationErrors`. Returns how many.
fn validate(context: &mut Node) -> usize {
    let problems: Vec<String> = match context.to_json() {
        Ok(_) => Vec::new(),
        Err(e) => vec![e.to_string()],
    };
    if !problems.is_empty() {
        warn!(problems = ?problems, "reconstructed context failed validation");
        if let Some(meta) = context
            .as_branch_mut()
            .and_then(|map| map.get_mut("metadata"))
        {
            meta.insert(
                "validationErrors",
                Node::List(problems.iter().map(|p| Node::from(p.as_str())).collect()),
            );
        }
    }
    problems.len()
}

// ── Salvage ───────────────────────────────────────────────────────────────

struct Salvager<'a> {
    root: &'a Node,
    ids: HashMap<String, NodePath>,
    active: HashSet<String>,
}

impl<'a> Salvager<'a> {
    fn copy(&mut self, node: &'a Node, depth: usize) -> Result<Option<Node>, ReconstructionError> {
        if depth > MAX_DEPTH {
            return Err(ReconstructionError::Salvage(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }
        match node {
            Node::Leaf(Scalar::Null) => Ok(None),
            Node::Leaf(_) => Ok(Some(node.clone())),
            Node::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(copied) = self.copy(item, depth + 1)? {
                        out.push(copied);
                    }
                }
                Ok(Some(Node::List(out)))
            }
            Node::Branch(map) => {
                let own_id = node.id();
                if let Some(id) = &own_id {
                    self.active.insert(id.clone());
                }
                let mut out = BTreeMap::new();
                for (key, child) in map {
                    if let Some(copied) = self.copy(child, depth + 1)? {
                        out.insert(key.clone(), copied);
                    }
                }
                if let Some(id) = &own_id {
                    self.active.remove(id);
                }
                Ok(Some(Node::Branch(out)))
            }
            // Dangling and cyclic references are skipped; live ones are
            // copied inline so the result is plain data.
            Node::Ref(id) => {
                if self.active.contains(id) {
                    return Ok(None);
                }
                let root = self.root;
                match self.ids.get(id).and_then(|path| root.get_path(path)) {
                    Some(target) => self.copy(target, depth + 1),
                    None => Ok(None),
                }
            }
        }
    }
}

fn salvage(state: &Node) -> Result<Node, ReconstructionError> {
    let mut salvager = Salvager {
        root: state,
        ids: state.id_table(),
        active: HashSet::new(),
    };
    match salvager.copy(state, 0)? {
        None => Err(ReconstructionError::Salvage("input is null".into())),
        Some(Node::Branch(map)) if map.is_empty() => {
            Err(ReconstructionError::Salvage("nothing to salvage".into()))
        }
        Some(Node::List(items)) if items.is_empty() => {
            Err(ReconstructionError::Salvage("nothing to salvage".into()))
        }
        Some(copied) => Ok(copied),
    }
}

fn minimal_context(now: DateTime<Utc>) -> Node {
    let mut context = Node::empty_branch();
    context.insert("id", Node::from(uuid::Uuid::new_v4().to_string()));
    context.insert("timestamp", Node::from(now.to_rfc3339()));
    context.insert("emergency", Node::from(true));
    context.insert("minimal", Node::from(true));
    context.insert("data", Node::empty_branch());
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{CompressOptions, CompressionLevel};
    use serde_json::json;

    fn reconstructor() -> Reconstructor {
        Reconstructor::default()
    }

    fn snapshot_of(context: &Node) -> Node {
        Compressor::default()
            .compress(
                context,
                &CompressOptions {
                    level: Some(CompressionLevel::Moderate),
                    compress_critical: false,
                },
            )
            .unwrap()
            .to_node()
            .unwrap()
    }

    fn without_metadata(mut node: Node) -> Node {
        if let Some(map) = node.as_branch_mut() {
            map.remove("metadata");
        }
        node
    }

    #[test]
    fn reconstructs_compressed_snapshot() {
        let context = Node::from(json!({
            "session": {"id": "s1", "turns": [{"text": "hi"}]},
            "apiKey": "k"
        }));
        let result = reconstructor().reconstruct(&snapshot_of(&context), &ReconstructOptions::default());

        assert!(result.success);
        assert!(!result.cache_hit);
        assert!(result.recovery_method.is_none());
        assert_eq!(without_metadata(result.context.clone()), context);

        let meta = result.context.get("metadata").unwrap();
        assert_eq!(meta.get("version").and_then(Node::as_str), Some(METADATA_VERSION));
        assert!(meta.get("created").is_some());
        assert!(meta.get("lastModified").is_some());
        assert!(meta.get("system").unwrap().flag("reconstructed"));
    }

    #[test]
    fn plain_context_is_accepted() {
        let context = Node::from(json!({"a": 1, "metadata": {"version": "2.0.0"}}));
        let result = reconstructor().reconstruct(&context, &ReconstructOptions::default());
        assert!(result.success);
        assert_eq!(result.context.get("a").and_then(Node::as_f64), Some(1.0));
        let meta = result.context.get("metadata").unwrap();
        assert_eq!(meta.get("version").and_then(Node::as_str), Some("2.0.0"));
        assert!(result.errors.is_empty());

        let stamped = Node::from(json!({
            "a": 1,
            "metadata": {"lastModified": "2020-01-01T00:00:00Z"}
        }));
        let result = reconstructor().reconstruct(&stamped, &ReconstructOptions::default());
        let meta = result.context.get("metadata").unwrap();
        assert_eq!(
            meta.get("lastModified").and_then(Node::as_str),
            Some("2020-01-01T00:00:00Z")
        );
        assert!(meta.get("created").is_some());
    }

    #[test]
    fn scalar_metadata_is_reported() {
        let context = Node::from(json!({"a": 1, "metadata": "v1"}));
        let result = reconstructor().reconstruct(&context, &ReconstructOptions::default());
        assert!(result.success);
        assert_eq!(result.context.get("metadata").and_then(Node::as_str), Some("v1"));
        assert_eq!(result.errors, vec!["metadata is not a mapping".to_string()]);
        assert_eq!(result.warning.as_deref(), Some("metadata could not be restored"));
    }

    #[test]
    fn repeated_reconstruction_hits_cache() {
        let mut map = serde_json::Map::new();
        for i in 0..200 {
            map.insert(format!("entry_{i}"), json!({"text": "some repeated text ".repeat(8)}));
        }
        let snapshot = snapshot_of(&Node::from(serde_json::Value::Object(map)));
        let r = reconstructor();

        let first = r.reconstruct(&snapshot, &ReconstructOptions::default());
        let second = r.reconstruct(&snapshot, &ReconstructOptions::default());

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.context, second.context);
        assert!(second.reconstruction_time <= first.reconstruction_time);

        let third = r.reconstruct(&snapshot, &ReconstructOptions { skip_cache: true });
        assert!(!third.cache_hit);
    }

    #[test]
    fn cache_evicts_oldest_first() {
        let done = |n: i64| Reconstructed {
            context: Node::from(n),
            report: DecodeReport::default(),
            issues: Vec::new(),
        };
        let mut cache = ReconstructionCache::new(2);
        cache.insert("a".into(), done(1));
        cache.insert("b".into(), done(2));
        cache.insert("c".into(), done(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").map(|d| d.context), Some(Node::from(3_i64)));
    }

    #[test]
    fn relationships_become_references() {
        let context = Node::from(json!({
            "items": [
                {"id": "a", "v": 1},
                {"id": "b", "dependencies": ["a", "ghost"]}
            ],
            "child": {"id": "c", "parentId": "b"}
        }));
        let result = reconstructor().reconstruct(&context, &ReconstructOptions::default());
        let items = result.context.get("items").and_then(Node::as_list).unwrap();
        let deps = items[1].get("dependencies").and_then(Node::as_list).unwrap();
        assert_eq!(deps[0], Node::Ref("a".into()));
        assert_eq!(deps[1], Node::from("ghost"));
        assert_eq!(
            result.context.get("child").and_then(|c| c.get("parent")),
            Some(&Node::Ref("b".into()))
        );
        // Expanded on serialization.
        let json = result.context.to_json().unwrap();
        assert_eq!(json["child"]["parent"]["id"], "b");
        assert_eq!(json["items"][1]["dependencies"][0]["v"], 1);
    }

    #[test]
    fn unserializable_result_records_validation_errors() {
        let context = Node::from(json!({
            "a": {"id": "a", "dependencies": ["b"]},
            "b": {"id": "b", "dependencies": ["a"]}
        }));
        let result = reconstructor().reconstruct(&context, &ReconstructOptions::default());
        assert!(result.success);
        let errors = result
            .context
            .get("metadata")
            .and_then(|m| m.get("validationErrors"))
            .and_then(Node::as_list)
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn malformed_snapshot_goes_to_emergency_recovery() {
        let r = reconstructor();
        let broken = Node::from(json!({"compressed": true, "nonCritical": "zzz", "keep": 1}));
        let result = r.reconstruct(&broken, &ReconstructOptions::default());
        assert!(!result.success);
        assert_eq!(result.recovery_method, Some(RecoveryMethod::Salvage));
        assert_eq!(result.warning.as_deref(), Some("data loss likely"));
        assert_eq!(result.context.get("keep").and_then(Node::as_f64), Some(1.0));
        assert!(result.errors[0].contains("malformed snapshot"));
    }

    #[test]
    fn undecodable_entries_are_reported() {
        let context = Node::from(json!({"a": {"x": 1}, "b": {"y": 2}}));
        let mut snapshot = snapshot_of(&context);
        if let Some(rest) = snapshot
            .as_branch_mut()
            .and_then(|m| m.get_mut("nonCritical"))
        {
            rest.insert("b", Node::from("not-a-blob!"));
        }
        let r = reconstructor();
        let first = r.reconstruct(&snapshot, &ReconstructOptions::default());
        assert!(first.success);
        assert_eq!(first.errors, vec!["nonCritical.b".to_string()]);
        assert!(first.warning.is_some());

        let second = r.reconstruct(&snapshot, &ReconstructOptions::default());
        assert!(second.cache_hit);
        assert_eq!(second.errors, first.errors);
        assert_eq!(second.warning, first.warning);
    }

    #[test]
    fn recovery_points_are_bounded_fifo() {
        let r = reconstructor();
        let ids: Vec<String> = (1..=15)
            .map(|i| r.create_recovery_point(&Node::from(json!({"n": i}))).unwrap())
            .collect();

        let listed: Vec<String> = r.recovery_points().into_iter().map(|p| p.id).collect();
        assert_eq!(listed, ids[5..].to_vec());

        let oldest = r.restore_point(&listed[0]).unwrap();
        assert_eq!(oldest.get("n").and_then(Node::as_f64), Some(6.0));
        assert!(matches!(
            r.restore_point(&ids[0]),
            Err(ReconstructionError::PointNotFound(_))
        ));
    }

    #[test]
    fn recovery_point_rejects_cycles() {
        let mut context = Node::from(json!({"id": "x"}));
        context.insert("me", Node::Ref("x".into()));
        assert!(matches!(
            reconstructor().create_recovery_point(&context),
            Err(ReconstructionError::Unserializable(_))
        ));
    }

    #[test]
    fn emergency_recovery_on_null_never_fails() {
        let result = reconstructor().emergency_recovery(&Node::null(), "x");
        assert!(!result.success);
        assert_eq!(result.recovery_method, Some(RecoveryMethod::Minimal));
        assert!(result.context.flag("emergency"));
        assert!(result.context.flag("minimal"));
        assert!(result.context.get("id").is_some());
        assert_eq!(result.context.get("data"), Some(&Node::empty_branch()));
        assert_eq!(result.errors[0], "x");
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn emergency_prefers_matching_point() {
        let r = reconstructor();
        let wanted = Node::from(json!({"v": "wanted"}));
        r.create_recovery_point(&wanted).unwrap();
        r.create_recovery_point(&Node::from(json!({"v": "latest"}))).unwrap();

        let matched = r.emergency_recovery(&wanted, "boom");
        assert!(matched.success);
        assert_eq!(matched.recovery_method, Some(RecoveryMethod::RecoveryPoint));
        assert_eq!(matched.context, wanted);

        let latest = r.emergency_recovery(&Node::from(json!({"other": 1})), "boom");
        assert_eq!(latest.context.get("v").and_then(Node::as_str), Some("latest"));
    }

    #[test]
    fn corrupted_point_falls_through_to_salvage() {
        let r = reconstructor();
        let id = r.create_recovery_point(&Node::from(json!({"v": 1}))).unwrap();
        r.points.write().unwrap()[0].context = Node::from(json!({"v": 2}));

        let result = r.emergency_recovery(&Node::from(json!({"keep": "me", "gone": null})), "boom");
        assert_eq!(result.recovery_method, Some(RecoveryMethod::Salvage));
        assert_eq!(result.context, Node::from(json!({"keep": "me"})));
        assert!(result.errors.iter().any(|e| e.contains(&id)));
        assert!(matches!(
            r.restore_point(&id),
            Err(ReconstructionError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn salvage_skips_dangling_and_cyclic_references() {
        let mut state = Node::from(json!({"id": "root", "data": {"id": "d", "x": 1}}));
        state.insert("dangling", Node::Ref("nowhere".into()));
        state.insert("loop", Node::Ref("root".into()));
        state.insert("alias", Node::Ref("d".into()));

        let salvaged = salvage(&state).unwrap();
        assert!(salvaged.get("dangling").is_none());
        assert!(salvaged.get("loop").is_none());
        assert_eq!(salvaged.get("alias"), state.get("data"));
        assert!(salvaged.to_json().is_ok());
    }

    #[test]
    fn salvage_rejects_too_deep_input() {
        let mut node = Node::from(1_i64);
        for _ in 0..=MAX_DEPTH {
            let mut wrapper = Node::empty_branch();
            wrapper.insert("n", node);
            node = wrapper;
        }
        assert!(matches!(salvage(&node), Err(ReconstructionError::Salvage(_))));
        assert!(salvage(&Node::empty_branch()).is_err());
    }

    #[test]
    fn clear_drops_points_and_cache() {
        let r = reconstructor();
        r.create_recovery_point(&Node::from(json!({"a": 1}))).unwrap();
        r.reconstruct(&Node::from(json!({"a": 1})), &ReconstructOptions::default());
        assert_eq!(r.cache_len(), 1);
        r.clear();
        assert!(r.recovery_points().is_empty());
        assert_eq!(r.cache_len(), 0);
    }
}
