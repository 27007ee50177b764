//! End-to-end integration tests for the ctxguard resilience engine.
//!
//! These tests drive the full pipeline through the public API (scoring,
//! strategy dispatch, shielded compression, reconstruction, recovery) and
//! the `ctxguard` binary itself.

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use ctxguard_config::{EngineConfig, ResistanceLevel};
use ctxguard_core::{EngineEvent, Node};
use ctxguard_engine::{
    CompressOptions, CompressedState, CompressionLevel, FixedProbe, ImportanceScorer,
    ReconstructOptions, RecoveryMethod, ResilienceEngine, ResistOptions, ScoringHints, Strategy,
};
use serde_json::{Value, json};

// ── Helpers ──────────────────────────────────────────────────────────────

fn engine() -> ResilienceEngine {
    ResilienceEngine::default().with_probe(Arc::new(FixedProbe(0)))
}

fn engine_with(config: EngineConfig) -> ResilienceEngine {
    ResilienceEngine::new(config)
        .unwrap()
        .with_probe(Arc::new(FixedProbe(0)))
}

fn conversation(turns: usize) -> Node {
    let turns: Vec<Value> = (0..turns)
        .map(|i| {
            json!({
                "role": if i % 2 == 0 { "user" } else { "assistant" },
                "text": format!("turn {i}: {}", "the quick brown fox ".repeat(6)),
                "accessCount": i * 10
            })
        })
        .collect();
    Node::from(json!({
        "system": {"systemCritical": true, "prompt": "You are a careful assistant."},
        "credentials": {"apiKey": "sk-test-123"},
        "history": {"turns": turns, "tags": ["user"]},
        "scratch": {"note": "temporary"},
        "schemaVersion": 3
    }))
}

fn strip_metadata(mut node: Node) -> Node {
    if let Some(map) = node.as_branch_mut() {
        map.remove("metadata");
    }
    node
}

fn write_temp(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn ctxguard(args: &[&str]) -> std::process::Output {
    let missing_config = std::env::temp_dir().join("ctxguard-e2e-missing.toml");
    Command::new(env!("CARGO_BIN_EXE_ctxguard"))
        .arg("--config")
        .arg(&missing_config)
        .args(args)
        .output()
        .expect("failed to run ctxguard binary")
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[test]
fn e2e_resist_then_reconstruct_from_snapshot() {
    let e = engine();
    let context = conversation(6);

    let outcome = e
        .resist(
            &context,
            &ResistOptions {
                strategy: Some(Strategy::Balanced),
                compress_critical: false,
            },
        )
        .unwrap();
    let report = outcome.report();
    assert!(report.applied);

    let snapshot = report.compressed.as_ref().unwrap().to_node().unwrap();
    let rebuilt = e.reconstruct(&snapshot, &ReconstructOptions::default());
    assert!(rebuilt.success);
    assert_eq!(strip_metadata(rebuilt.context), outcome.context);

    // The system prompt is critical and survives every filtering strategy.
    assert_eq!(outcome.context.get("system"), context.get("system"));
}

#[test]
fn e2e_sensitive_fields_are_shielded() {
    let context = Node::from(json!({"a": {"password": "p1"}, "b": {"value": "v"}}));
    let state = engine()
        .compress(
            &context,
            &CompressOptions {
                level: Some(CompressionLevel::Light),
                compress_critical: false,
            },
        )
        .unwrap();

    assert_eq!(
        state
            .critical
            .get("a")
            .and_then(|a| a.get("password"))
            .and_then(Node::as_str),
        Some("p1")
    );
    assert!(state.non_critical.get("b").and_then(Node::as_str).is_some());
}

#[test]
fn e2e_compression_roundtrip_for_every_level() {
    let e = engine();
    let context = conversation(20);
    for level in [
        CompressionLevel::None,
        CompressionLevel::Light,
        CompressionLevel::Moderate,
        CompressionLevel::Heavy,
    ] {
        let state = e
            .compress(
                &context,
                &CompressOptions {
                    level: Some(level),
                    compress_critical: false,
                },
            )
            .unwrap();
        assert_eq!(e.decompress(&state), context, "level {level}");
    }
}

#[test]
fn e2e_critical_branch_survives_resistance() {
    let context = Node::from(json!({
        "critical": {"systemCritical": true, "data": "keep"},
        "normal": {"data": "drop-candidate"}
    }));
    let outcome = engine().resist(&context, &ResistOptions::default()).unwrap();
    assert_eq!(
        outcome
            .context
            .get("critical")
            .and_then(|c| c.get("data"))
            .and_then(Node::as_str),
        Some("keep")
    );
    assert!(outcome.report().preservation_rate.unwrap() >= 0.5);
}

#[test]
fn e2e_repeated_reconstruction_is_cached() {
    let e = engine();
    let state = e
        .compress(
            &conversation(50),
            &CompressOptions {
                level: Some(CompressionLevel::Heavy),
                compress_critical: false,
            },
        )
        .unwrap();
    let snapshot = state.to_node().unwrap();

    let first = e.reconstruct(&snapshot, &ReconstructOptions::default());
    let second = e.reconstruct(&snapshot, &ReconstructOptions::default());
    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert!(second.reconstruction_time <= first.reconstruction_time);
    assert_eq!(first.context, second.context);
    assert_eq!(e.metrics().cached_reconstructions, 1);
}

#[test]
fn e2e_self_reference_triggers_emergency_protection() {
    let mut context = Node::from(json!({"id": "loop"}));
    context.insert("self", Node::Ref("loop".into()));

    let outcome = engine().resist(&context, &ResistOptions::default()).unwrap();
    let report = outcome.report();
    assert!(!report.applied);
    assert!(report.emergency || report.failed);
}

#[test]
fn e2e_recovery_points_keep_latest_ten() {
    let e = engine();
    for i in 1..=15 {
        e.create_recovery_point(&Node::from(json!({"n": i}))).unwrap();
    }
    let points = e.recovery_points();
    assert_eq!(points.len(), 10);
    let restored: Vec<f64> = points
        .iter()
        .map(|p| {
            e.restore_point(&p.id)
                .unwrap()
                .get("n")
                .and_then(Node::as_f64)
                .unwrap()
        })
        .collect();
    assert_eq!(restored, (6..=15).map(f64::from).collect::<Vec<_>>());
}

#[test]
fn e2e_emergency_recovery_of_null() {
    let result = engine().emergency_recovery(&Node::null(), "x");
    assert!(result.recovery_method.is_some());
    assert!(result.context.is_branch());

    let e = engine();
    e.create_recovery_point(&Node::from(json!({"saved": true}))).unwrap();
    let result = e.emergency_recovery(&Node::null(), "x");
    assert_eq!(result.recovery_method, Some(RecoveryMethod::RecoveryPoint));
    assert!(result.context.flag("saved"));
}

// ── Scoring properties ───────────────────────────────────────────────────

#[test]
fn e2e_system_critical_never_lowers_score() {
    let scorer = ImportanceScorer::default();
    let bases = [
        json!({}),
        json!({"accessCount": 40, "tags": ["core"]}),
        json!({"priority": 3, "dependencies": ["a", "b"]}),
        json!({"timestamp": "2020-01-01T00:00:00Z", "lastAccessed": "2024-06-01T00:00:00Z"}),
    ];
    for base in bases {
        let plain = Node::from(base.clone());
        let mut flagged = plain.clone();
        flagged.insert("systemCritical", Node::from(true));
        let hints = ScoringHints::default();
        assert!(
            scorer.calculate_score(&flagged, &hints).score
                >= scorer.calculate_score(&plain, &hints).score,
            "{base}"
        );
    }
}

#[test]
fn e2e_newer_context_scores_at_least_older() {
    let scorer = ImportanceScorer::default();
    let hints = ScoringHints::default();
    let newer = Node::from(json!({"timestamp": "2026-01-10T00:00:00Z"}));
    let older = Node::from(json!({"timestamp": "2025-12-01T00:00:00Z"}));
    assert!(
        scorer.calculate_score(&newer, &hints).score >= scorer.calculate_score(&older, &hints).score
    );
}

// ── Configuration & events ───────────────────────────────────────────────

#[test]
fn e2e_config_file_drives_engine() {
    let file = write_temp(
        r#"
resistance_level = "aggressive"
max_recovery_points = 2

[classifier]
extra_patterns = ["^ssn$"]
"#,
    );
    let config = EngineConfig::load_from(file.path()).unwrap();
    assert_eq!(config.resistance_level, ResistanceLevel::Aggressive);

    let e = engine_with(config);
    for _ in 0..3 {
        let outcome = e.resist(&conversation(2), &ResistOptions::default()).unwrap();
        assert_eq!(outcome.report().strategy, Some(Strategy::Aggressive));
    }
    assert_eq!(e.recovery_points().len(), 2);

    let state = e
        .compress(
            &Node::from(json!({"ssn": "123-45-6789", "name": "n"})),
            &CompressOptions::default(),
        )
        .unwrap();
    assert!(state.critical.get("ssn").is_some());
    assert!(state.critical.get("name").is_none());
}

#[tokio::test]
async fn e2e_events_reach_subscribers() {
    let e = engine();
    let mut rx = e.subscribe();
    e.resist(&conversation(3), &ResistOptions::default()).unwrap();

    let event = rx.recv().await.unwrap();
    match event.as_ref() {
        EngineEvent::Resistance {
            size_before,
            size_after,
            ..
        } => {
            assert!(*size_before > 0);
            assert!(*size_after > 0);
        }
        other => panic!("expected resistance event, got {other:?}"),
    }
}

// ── Binary ───────────────────────────────────────────────────────────────

#[test]
fn e2e_cli_compress_then_decompress() {
    let context = json!({"token": "t-1", "notes": {"text": "hello ".repeat(50)}});
    let input = write_temp(&context.to_string());

    let out = ctxguard(&["compress", input.path().to_str().unwrap(), "--level", "heavy"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let state: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(state["compressed"], true);
    assert_eq!(state["level"], "heavy");
    assert_eq!(state["critical"]["token"], "t-1");

    let snapshot = write_temp(&state.to_string());
    let out = ctxguard(&["decompress", snapshot.path().to_str().unwrap(), "--strict"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let restored: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(restored, context);

    // The envelope parses back into the library type too.
    let node = Node::from(state);
    assert!(CompressedState::from_node(&node).is_ok());
}

#[test]
fn e2e_cli_resist_and_score() {
    let input = write_temp(
        &json!({
            "critical": {"systemCritical": true, "data": "keep"},
            "normal": {"data": "drop-candidate"}
        })
        .to_string(),
    );
    let path = input.path().to_str().unwrap();

    let out = ctxguard(&["resist", path, "--strategy", "low-memory"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let outcome: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(outcome["metadata"]["resistance"]["strategy"], "lowMemory");
    assert_eq!(outcome["context"]["critical"]["data"], "keep");

    let out = ctxguard(&["score", path]);
    assert!(out.status.success());
    let listing: Value = serde_json::from_slice(&out.stdout).unwrap();
    let branches = listing["branches"].as_array().unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[0]["path"], "critical");
    assert!(branches[0]["score"].as_f64().unwrap() > branches[1]["score"].as_f64().unwrap());
}

#[test]
fn e2e_cli_default_config_is_valid_toml() {
    let out = ctxguard(&["config", "default"]);
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    let parsed: EngineConfig = toml::from_str(&text).unwrap();
    assert!(parsed.validate().is_ok());
}

#[test]
fn e2e_cli_rejects_bad_input() {
    let input = write_temp("{not json");
    let out = ctxguard(&["resist", input.path().to_str().unwrap()]);
    assert!(!out.status.success());
}
