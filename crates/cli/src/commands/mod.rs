pub mod compress;
pub mod config_cmd;
pub mod reconstruct;
pub mod resist;
pub mod score;

use ctxguard_core::Node;
use serde::Serialize;
use std::io::Read;

/// Read a JSON context from a file, or stdin for `-`.
pub fn read_context(input: &str) -> Result<Node, Box<dyn std::error::Error>> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input).map_err(|e| format!("Failed to read {input}: {e}"))?
    };
    let node: Node =
        serde_json::from_str(&text).map_err(|e| format!("{input} is not valid JSON: {e}"))?;
    tracing::debug!(input, keys = node.count_keys(), "context loaded");
    Ok(node)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
