//! `ctxguard compress` / `ctxguard decompress`.

use super::{print_json, read_context};
use ctxguard_engine::{CompressOptions, CompressedState, CompressionLevel, ResilienceEngine};

pub fn compress(
    engine: &ResilienceEngine,
    input: &str,
    level: Option<CompressionLevel>,
    compress_critical: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = read_context(input)?;
    let state = engine.compress(
        &context,
        &CompressOptions {
            level,
            compress_critical,
        },
    )?;
    eprintln!(
        "📦 {} → {} bytes ({:.1}% saved, level {})",
        state.original_size,
        state.compressed_size,
        state.compression_ratio * 100.0,
        state.level
    );
    print_json(&state)
}

pub fn decompress(
    engine: &ResilienceEngine,
    input: &str,
    strict: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = read_context(input)?;
    let state = CompressedState::from_node(&node)?;

    if strict {
        return print_json(&engine.decompress_strict(&state)?);
    }

    let decoded = engine.decompress_with_report(&state);
    for path in &decoded.report.passed_through {
        eprintln!("⚠️  {path} could not be decoded, passed through raw");
    }
    print_json(&decoded.context)
}
