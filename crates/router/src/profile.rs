//! Agent profiles and per-session policies.
//!
//! Profiles are flat in-memory lookups seeded at startup; session policies
//! live in the opaque key/value store so operators can adjust model and
//! thinking level per conversation without touching agent config.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use lemon_domain::{Origin, ToolPolicy};
use lemon_sessions::KvStore;

const POLICY_PREFIX: &str = "session_policy";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub default_engine: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tool_policy: Option<ToolPolicy>,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct AgentProfiles {
    inner: RwLock<HashMap<String, AgentProfile>>,
}

impl AgentProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: AgentProfile) {
        self.inner
            .write()
            .insert(profile.agent_id.clone(), profile);
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.inner.read().get(agent_id).cloned()
    }

    /// Exact profile, falling back to the `default` agent when one is
    /// configured.  `None` means the submit fails with `unknown_agent_id`.
    pub fn resolve(&self, agent_id: &str) -> Option<AgentProfile> {
        let inner = self.inner.read();
        inner
            .get(agent_id)
            .or_else(|| inner.get("default"))
            .cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub tool_policy: Option<ToolPolicy>,
}

pub struct SessionPolicies {
    kv: Arc<dyn KvStore>,
}

impl SessionPolicies {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get(&self, session_key: &str) -> SessionPolicy {
        self.kv
            .get(&format!("{POLICY_PREFIX}:{session_key}"))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set(&self, session_key: &str, policy: &SessionPolicy) {
        match serde_json::to_value(policy) {
            Ok(v) => self.kv.put(&format!("{POLICY_PREFIX}:{session_key}"), v),
            Err(e) => tracing::warn!(error = %e, "failed to encode session policy"),
        }
    }

    /// The per-run base tool policy.  Possibly empty, never absent.
    pub fn resolve_for_run(
        &self,
        session_key: &str,
        _agent_id: &str,
        _origin: Origin,
    ) -> ToolPolicy {
        self.get(session_key).tool_policy.unwrap_or_default()
    }
}
