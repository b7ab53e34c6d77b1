//! Node filters for `require` / `include` / `exclude` allocation rules
//!
//! Keys are node attributes, or one of the built-in keys `_id`, `_name`, `_host`
//! and `_address`. Values are comma separated patterns; `*` matches any run of characters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::node::DiscoveryNode;

/// Allocation filter set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFilters {
    /// The node must match every entry
    pub require: BTreeMap<String, String>,
    /// The node must match at least one entry
    pub include: BTreeMap<String, String>,
    /// The node must match no entry
    pub exclude: BTreeMap<String, String>,
}

impl NodeFilters {
    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.include.is_empty() && self.exclude.is_empty()
    }

    /// First violated rule for `node`, if any, rendered for explanations
    pub fn violation(&self, node: &DiscoveryNode) -> Option<String> {
        for (key, patterns) in &self.require {
            if !matches_any(node, key, patterns) {
                return Some(format!("node does not match require filter [{}:{}]", key, patterns));
            }
        }
        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|(key, patterns)| matches_any(node, key, patterns))
        {
            return Some(format!("node does not match any include filter {:?}", self.include));
        }
        for (key, patterns) in &self.exclude {
            if matches_any(node, key, patterns) {
                return Some(format!("node matches exclude filter [{}:{}]", key, patterns));
            }
        }
        None
    }

    pub fn matches(&self, node: &DiscoveryNode) -> bool {
        self.violation(node).is_none()
    }
}

fn node_value<'a>(node: &'a DiscoveryNode, key: &str) -> Option<&'a str> {
    match key {
        "_id" => Some(node.id.as_str()),
        "_name" => Some(node.name.as_str()),
        "_host" => Some(node.host()),
        "_address" => Some(node.address.as_str()),
        attr => node.attributes.get(attr).map(String::as_str),
    }
}

fn matches_any(node: &DiscoveryNode, key: &str, patterns: &str) -> bool {
    let Some(value) = node_value(node, key) else {
        return false;
    };
    patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .any(|pattern| glob_match(pattern, value))
}

/// Simple glob matching supporting `*`
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
