//! Critical-data classification.
//!
//! Which fields count as sensitive is policy, not an engine invariant, so
//! the compressor takes any [`CriticalityClassifier`]. [`PatternClassifier`]
//! is the stock policy; plain closures work too.

use ctxguard_config::ClassifierConfig;
use ctxguard_core::{Node, NodePath};
use regex_lite::Regex;

/// Field names (and values) containing any of these are sensitive.
pub const SENSITIVE_NAMES: [&str; 6] = ["password", "secret", "key", "token", "credential", "auth"];

/// Decides whether a field must be shielded from lossy handling.
pub trait CriticalityClassifier: Send + Sync {
    /// `key` is the field name, `path` its full structural path and `node`
    /// its value.
    fn is_critical(&self, key: &str, path: &NodePath, node: &Node) -> bool;
}

impl<F> CriticalityClassifier for F
where
    F: Fn(&str, &NodePath, &Node) -> bool + Send + Sync,
{
    fn is_critical(&self, key: &str, path: &NodePath, node: &Node) -> bool {
        self(key, path, node)
    }
}

/// Name-pattern and flag based classifier.
///
/// A field is critical when its key, its path or its string value mentions a
/// sensitive name, or when it is a branch flagged `systemCritical` or
/// `userMarked`, or with `priority` above the threshold.
///
/// The compressor only consults it for mapping entries, so fields inside
/// list items are never classified on their own.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    extra: Vec<Regex>,
    priority_threshold: f64,
}

impl PatternClassifier {
    /// Built-in names only, priority threshold 8.
    pub fn new() -> Self {
        Self {
            extra: Vec::new(),
            priority_threshold: 8.0,
        }
    }

    /// Built-in names plus the configured extra patterns.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, regex_lite::Error> {
        let extra = config
            .extra_patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            extra,
            priority_threshold: config.priority_threshold,
        })
    }

    /// Does `text` mention a sensitive name?
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        SENSITIVE_NAMES.iter().any(|name| lower.contains(name))
            || self.extra.iter().any(|re| re.is_match(text))
    }

    fn flagged(&self, node: &Node) -> bool {
        node.is_branch()
            && (node.flag("systemCritical")
                || node.flag("userMarked")
                || node
                    .number("priority")
                    .is_some_and(|p| p > self.priority_threshold))
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalityClassifier for PatternClassifier {
    fn is_critical(&self, key: &str, path: &NodePath, node: &Node) -> bool {
        self.matches(key)
            || self.matches(&path.to_string())
            || node.as_str().is_some_and(|value| self.matches(value))
            || self.flagged(node)
    }
}
