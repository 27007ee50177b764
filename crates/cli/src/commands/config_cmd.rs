//! `ctxguard config` — Configuration management commands.

use ctxguard_config::{ConfigError, EngineConfig};
use std::path::{Path, PathBuf};

/// Load from an explicit path, or the default location. Environment
/// overrides apply either way.
pub fn load(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => EngineConfig::load(),
    }
}

fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| EngineConfig::config_dir().join("config.toml"))
}

pub fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match load(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if (config.scoring.total() - 1.0).abs() > 1e-6 {
                warnings.push(format!(
                    "Scoring weights sum to {:.3}, not 1.0; scores will be skewed",
                    config.scoring.total()
                ));
            }

            if !config.enable_emergency_recovery {
                warnings.push("Emergency recovery disabled: failed passes return errors".into());
            }

            if !config.monitor.enabled {
                warnings.push("Memory monitor disabled".into());
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!("   Level:          {:?}", config.resistance_level);
            println!("   Memory budget:  {} MB", config.memory_budget_mb);
            println!("   Recovery pts:   {}", config.max_recovery_points);
            println!("   Cache:          {}", config.cache_capacity);
            println!("   Extra patterns: {}", config.classifier.extra_patterns.len());
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path).map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn default_file() {
    print!("{}", EngineConfig::default_toml());
}

pub fn path(path: Option<&Path>) {
    println!("{}", config_path(path).display());
}
