//! `ctxguard score` — importance of every branch in a context.

use super::{print_json, read_context};
use ctxguard_core::NodePath;
use ctxguard_engine::{ImportanceScore, ResilienceEngine};
use serde::Serialize;

#[derive(Serialize)]
struct ScoredBranch<'a> {
    path: &'a NodePath,
    #[serde(flatten)]
    score: &'a ImportanceScore,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreListing<'a> {
    mean_score: Option<f64>,
    branches: Vec<ScoredBranch<'a>>,
}

pub fn run(engine: &ResilienceEngine, input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let context = read_context(input)?;
    let table = engine.score_context(&context);

    let listing = ScoreListing {
        mean_score: table.mean(),
        branches: table
            .iter()
            .map(|(path, score)| ScoredBranch { path, score })
            .collect(),
    };
    print_json(&listing)
}
