//! Tool policies — nested permission maps merged with restrictive-wins
//! semantics.
//!
//! A policy is an open map so operators can carry engine-specific options
//! without the core knowing about them.  Only the keys below get special
//! merge treatment:
//!
//! - `allowed`: allow-list of tools → intersection (more restrictive wins)
//! - `blocked_tools`, `require_approval`: deny-style lists → union, deduped
//! - nested maps → deep-merged recursively
//! - everything else → the override side wins

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Allow-list key: merged by intersection.
const ALLOWED_KEY: &str = "allowed";

/// Deny-style list keys: merged by union.
const UNION_KEYS: &[&str] = &["blocked_tools", "require_approval"];

/// A tool policy.  Wraps a JSON object; never `null` — "no policy" is the
/// empty map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolPolicy(pub Map<String, Value>);

impl ToolPolicy {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from any JSON value.  Non-objects yield `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Tools listed under `allowed`, if any.
    pub fn allowed(&self) -> Option<Vec<&str>> {
        self.0
            .get(ALLOWED_KEY)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
    }

    /// Tools listed under `blocked_tools`.
    pub fn blocked_tools(&self) -> Vec<&str> {
        self.0
            .get("blocked_tools")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Merge two policies.  `b` layers on top of `a`; list keys follow the
    /// restrictive-wins rules documented at module level.
    pub fn merge(a: Option<&ToolPolicy>, b: Option<&ToolPolicy>) -> ToolPolicy {
        match (a, b) {
            (None, None) => ToolPolicy::new(),
            (Some(a), None) => a.clone(),
            (None, Some(b)) => b.clone(),
            (Some(a), Some(b)) => ToolPolicy(merge_maps(&a.0, &b.0)),
        }
    }
}

fn merge_maps(a: &Map<String, Value>, b: &Map<String, Value>) -> Map<String, Value> {
    let mut out = a.clone();
    for (key, bv) in b {
        let merged = match (out.get(key), bv) {
            (Some(Value::Array(av)), Value::Array(bv)) if key == ALLOWED_KEY => {
                Value::Array(intersect(av, bv))
            }
            (Some(Value::Array(av)), Value::Array(bv)) if UNION_KEYS.contains(&key.as_str()) => {
                Value::Array(union(av, bv))
            }
            (Some(Value::Object(am)), Value::Object(bm)) => Value::Object(merge_maps(am, bm)),
            _ => bv.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}

fn intersect(a: &[Value], b: &[Value]) -> Vec<Value> {
    a.iter().filter(|v| b.contains(v)).cloned().collect()
}

fn union(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut out = a.to_vec();
    for v in b {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pol(v: Value) -> ToolPolicy {
        ToolPolicy::from_value(v).unwrap()
    }

    #[test]
    fn merge_both_nil_is_empty() {
        assert!(ToolPolicy::merge(None, None).is_empty());
    }

    #[test]
    fn merge_one_side_returns_other() {
        let a = pol(json!({"sandbox": true}));
        assert_eq!(ToolPolicy::merge(Some(&a), None), a);
        assert_eq!(ToolPolicy::merge(None, Some(&a)), a);
    }

    #[test]
    fn allowed_lists_intersect() {
        let a = pol(json!({"allowed": ["bash", "read", "write"]}));
        let b = pol(json!({"allowed": ["read", "write", "fetch"]}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(merged.allowed().unwrap(), vec!["read", "write"]);
    }

    #[test]
    fn blocked_tools_union_deduped() {
        let a = pol(json!({"blocked_tools": ["bash", "fetch"]}));
        let b = pol(json!({"blocked_tools": ["fetch", "exec"]}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(merged.blocked_tools(), vec!["bash", "fetch", "exec"]);
    }

    #[test]
    fn require_approval_unions_too() {
        let a = pol(json!({"require_approval": ["bash"]}));
        let b = pol(json!({"require_approval": ["write"]}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(
            merged.get("require_approval").unwrap(),
            &json!(["bash", "write"])
        );
    }

    #[test]
    fn nested_maps_deep_merge() {
        let a = pol(json!({"approvals": {"bash": "always", "read": "never"}}));
        let b = pol(json!({"approvals": {"bash": "never"}}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(
            merged.get("approvals").unwrap(),
            &json!({"bash": "never", "read": "never"})
        );
    }

    #[test]
    fn scalar_override_b_wins() {
        let a = pol(json!({"sandbox": true}));
        let b = pol(json!({"sandbox": false}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(merged.get("sandbox").unwrap(), &json!(false));
    }

    #[test]
    fn keys_only_in_a_are_kept() {
        let a = pol(json!({"sandbox": true, "allowed": ["read"]}));
        let b = pol(json!({"extra": 1}));
        let merged = ToolPolicy::merge(Some(&a), Some(&b));
        assert_eq!(merged.get("sandbox").unwrap(), &json!(true));
        assert_eq!(merged.get("extra").unwrap(), &json!(1));
        assert_eq!(merged.allowed().unwrap(), vec!["read"]);
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(ToolPolicy::from_value(json!(["a"])).is_none());
        assert!(ToolPolicy::from_value(json!("x")).is_none());
    }
}
