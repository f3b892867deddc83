//! The two routing tables: exact-match API rules and leading-segment
//! prefix rules.
//!
//! Both tables are immutable once built; reloads construct a new table
//! off-lock and swap the snapshot pointer. Load-time duplicates are a
//! misconfiguration and fail the whole load.

use portico_common::{ApiRule, GatewayError, Result, RoutingRule};
use std::collections::HashMap;
use std::sync::Arc;

/// Exact `(method, path)` matching. Paths are compared lowercased; the
/// verb list of a rule is a CSV checked per request.
#[derive(Default, Debug)]
pub struct ApiTable {
    rules: HashMap<String, Arc<ApiRule>>,
}

impl ApiTable {
    pub fn load(rules: Vec<ApiRule>) -> Result<Self> {
        let mut table = HashMap::with_capacity(rules.len());
        for rule in rules {
            let path = rule.path.to_lowercase();
            if table.contains_key(&path) {
                return Err(GatewayError::ConfigInvalid(format!(
                    "duplicate path rule: {path}"
                )));
            }
            tracing::info!(path = %path, method = %rule.method, "URI rule registered");
            table.insert(path, Arc::new(rule));
        }
        Ok(Self { rules: table })
    }

    /// The rule for `(method, path)`, iff both match.
    pub fn match_api(&self, method: &str, path: &str) -> Option<Arc<ApiRule>> {
        let rule = self.rules.get(&path.to_lowercase())?;
        rule.allows_method(method).then(|| rule.clone())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Leading-segment prefix matching with optional prefix stripping.
#[derive(Default, Debug)]
pub struct RoutingTable {
    rules: HashMap<String, Arc<RoutingRule>>,
}

impl RoutingTable {
    pub fn load(rules: Vec<RoutingRule>) -> Result<Self> {
        let mut table = HashMap::with_capacity(rules.len());
        for mut rule in rules {
            let mut prefix = rule.prefix.to_lowercase();
            if !prefix.starts_with('/') {
                prefix = format!("/{prefix}");
            }
            // "/x" is the shortest addressable prefix; anything shorter
            // would swallow every request.
            if prefix.len() <= 1 {
                tracing::warn!(prefix = %rule.prefix, "routing prefix too short, skipped");
                continue;
            }
            if table.contains_key(&prefix) {
                return Err(GatewayError::ConfigInvalid(format!(
                    "duplicate routing prefix: {prefix}"
                )));
            }
            tracing::info!(cluster = %rule.cluster_id, prefix = %prefix, "routing rule registered");
            rule.prefix = prefix.clone();
            table.insert(prefix, Arc::new(rule));
        }
        Ok(Self { rules: table })
    }

    /// Look up the rule for the leading segment of `path`.
    pub fn match_routing(&self, path: &str) -> Option<Arc<RoutingRule>> {
        let prefix = leading_segment(path).to_lowercase();
        self.rules.get(&prefix).cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The path up to (excluding) the second `/`: `/srv/name` → `/srv`.
fn leading_segment(path: &str) -> &str {
    if path.len() <= 1 {
        return path;
    }
    match path[1..].find('/') {
        Some(pos) => &path[..pos + 1],
        None => path,
    }
}
