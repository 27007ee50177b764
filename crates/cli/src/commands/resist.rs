//! `ctxguard resist` — run a resistance pass over a context file.

use super::{print_json, read_context};
use ctxguard_engine::{ResilienceEngine, ResistOptions, Strategy};

pub fn run(
    engine: &ResilienceEngine,
    input: &str,
    strategy: Option<Strategy>,
    compress_critical: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = read_context(input)?;
    let outcome = engine.resist(
        &context,
        &ResistOptions {
            strategy,
            compress_critical,
        },
    )?;

    let report = outcome.report();
    if !report.applied {
        eprintln!(
            "⚠️  Resistance not applied: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    print_json(&outcome)
}
