//! Auto-approval and default-parameter resolution keyed on tool names.

use netdash_core::config::{AutoApproveConfig, ConfigError, DefaultParamsConfig};
use regex::Regex;
use serde_json::{Map, Value};

const READ_ONLY_PREFIXES: [&str; 7] = ["get", "list", "search", "find", "describe", "show", "check"];
const READ_ONLY_SUFFIXES: [&str; 6] = ["status", "statuses", "stats", "history", "overview", "summary"];

/// Glob pattern (`*` any run, `?` exactly one character) compiled to an
/// anchored full-string match.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|err| ConfigError::Invalid {
            field: format!("pattern '{pattern}'"),
            message: err.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved(ApprovalReason),
    RequiresApproval,
}

impl ApprovalDecision {
    pub fn is_approved(self) -> bool {
        matches!(self, ApprovalDecision::Approved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalReason {
    ApproveAll,
    ExactName,
    Pattern,
    ReadOnlyName,
}

/// Built once from the configuration document; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct PolicyMatcher {
    enabled: bool,
    approve_all: bool,
    exact: Vec<String>,
    patterns: Vec<GlobPattern>,
    exclude: Vec<String>,
    read_only_heuristic: bool,
    default_patterns: Vec<(GlobPattern, Map<String, Value>)>,
    default_tools: Map<String, Value>,
}

impl PolicyMatcher {
    pub fn new(
        approve: &AutoApproveConfig,
        defaults: &DefaultParamsConfig,
    ) -> Result<Self, ConfigError> {
        let patterns = approve
            .patterns
            .iter()
            .map(|pattern| GlobPattern::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let default_patterns = defaults
            .patterns
            .iter()
            .map(|entry| Ok((GlobPattern::new(&entry.pattern)?, entry.params.clone())))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            enabled: approve.enabled,
            approve_all: approve.approve_all,
            exact: approve.tools.clone(),
            patterns,
            exclude: approve.exclude.clone(),
            read_only_heuristic: approve.read_only_heuristic,
            default_patterns,
            default_tools: defaults.tools.clone(),
        })
    }

    /// First matching rule wins; exclusion short-circuits everything.
    pub fn approval(&self, name: &str) -> ApprovalDecision {
        if self.exclude.iter().any(|excluded| excluded == name) {
            return ApprovalDecision::RequiresApproval;
        }
        if !self.enabled {
            return ApprovalDecision::RequiresApproval;
        }
        if self.approve_all {
            return ApprovalDecision::Approved(ApprovalReason::ApproveAll);
        }
        if self.exact.iter().any(|exact| exact == name) {
            return ApprovalDecision::Approved(ApprovalReason::ExactName);
        }
        if self.patterns.iter().any(|pattern| pattern.matches(name)) {
            return ApprovalDecision::Approved(ApprovalReason::Pattern);
        }
        if self.read_only_heuristic && is_read_only_name(name) {
            return ApprovalDecision::Approved(ApprovalReason::ReadOnlyName);
        }
        ApprovalDecision::RequiresApproval
    }

    pub fn is_auto_approved(&self, name: &str) -> bool {
        self.approval(name).is_approved()
    }

    /// Shallow merge of every matching pattern's params in declaration order,
    /// then the exact-name entry on top.
    pub fn default_params(&self, name: &str) -> Map<String, Value> {
        let mut merged = Map::new();
        for (pattern, params) in &self.default_patterns {
            if pattern.matches(name) {
                for (key, value) in params {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        if let Some(Value::Object(params)) = self.default_tools.get(name) {
            for (key, value) in params {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

pub fn is_read_only_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    READ_ONLY_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
        || READ_ONLY_SUFFIXES
            .iter()
            .any(|suffix| lowered.ends_with(suffix))
}
