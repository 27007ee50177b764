//! `ctxguard reconstruct` — rebuild a context from a snapshot.

use super::{print_json, read_context};
use ctxguard_engine::{ReconstructOptions, ResilienceEngine};

pub fn run(
    engine: &ResilienceEngine,
    input: &str,
    skip_cache: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = read_context(input)?;
    let result = engine.reconstruct(&snapshot, &ReconstructOptions { skip_cache });

    if let Some(method) = result.recovery_method {
        eprintln!("🚑 Emergency recovery used: {}", method.as_str());
    }
    if let Some(warning) = &result.warning {
        eprintln!("⚠️  {warning}");
    }
    print_json(&result)
}
