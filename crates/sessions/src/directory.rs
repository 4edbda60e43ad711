//! Agent session directory — last-activity bookkeeping per agent, used by
//! the inbox `latest`/`new` session selectors and fanout routing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lemon_domain::Route;

use crate::kv::KvStore;

const INDEX_PREFIX: &str = "sessions_index";
const PRIMARY_ROUTE_PREFIX: &str = "agent_primary_route";

/// A directory entry: one session the agent has been active on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub session_key: String,
    pub last_activity_ms: i64,
    #[serde(default)]
    pub route: Option<Route>,
}

/// Optional filter for `latest_matching`.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub channel_id: Option<String>,
    pub account_id: Option<String>,
    pub peer_id: Option<String>,
}

impl RouteFilter {
    pub fn matches(&self, route: Option<&Route>) -> bool {
        let Some(route) = route else {
            return self.channel_id.is_none()
                && self.account_id.is_none()
                && self.peer_id.is_none();
        };
        self.channel_id
            .as_deref()
            .map_or(true, |c| c == route.channel_id)
            && self
                .account_id
                .as_deref()
                .map_or(true, |a| a == route.account_id)
            && self.peer_id.as_deref().map_or(true, |p| p == route.peer_id)
    }
}

pub struct AgentDirectory {
    kv: Arc<dyn KvStore>,
}

impl AgentDirectory {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn entry_key(agent_id: &str, session_key: &str) -> String {
        format!("{INDEX_PREFIX}:{agent_id}:{session_key}")
    }

    /// Record that a run was admitted on this session.
    pub fn record_activity(
        &self,
        agent_id: &str,
        session_key: &str,
        route: Option<Route>,
        now_ms: i64,
    ) {
        let entry = DirectoryEntry {
            session_key: session_key.to_owned(),
            last_activity_ms: now_ms,
            route,
        };
        match serde_json::to_value(&entry) {
            Ok(v) => self.kv.put(&Self::entry_key(agent_id, session_key), v),
            Err(e) => tracing::warn!(error = %e, "failed to encode directory entry"),
        }
    }

    fn entries(&self, agent_id: &str) -> Vec<DirectoryEntry> {
        let prefix = format!("{INDEX_PREFIX}:{agent_id}:");
        self.kv
            .keys_with_prefix(&prefix)
            .into_iter()
            .filter_map(|k| self.kv.get(&k))
            .filter_map(|v: Value| serde_json::from_value(v).ok())
            .collect()
    }

    /// The most recently active session for an agent.
    pub fn latest(&self, agent_id: &str) -> Option<String> {
        self.latest_matching(agent_id, &RouteFilter::default())
    }

    /// The most recently active session matching a route filter.
    pub fn latest_matching(&self, agent_id: &str, filter: &RouteFilter) -> Option<String> {
        self.entries(agent_id)
            .into_iter()
            .filter(|e| filter.matches(e.route.as_ref()))
            .max_by_key(|e| e.last_activity_ms)
            .map(|e| e.session_key)
    }

    /// The most recently active session that is bound to a chat route.
    pub fn latest_with_route(&self, agent_id: &str) -> Option<String> {
        self.entries(agent_id)
            .into_iter()
            .filter(|e| e.route.is_some())
            .max_by_key(|e| e.last_activity_ms)
            .map(|e| e.session_key)
    }

    /// The agent's configured primary route, if one was set.
    pub fn primary_route(&self, agent_id: &str) -> Option<Route> {
        let v = self.kv.get(&format!("{PRIMARY_ROUTE_PREFIX}:{agent_id}"))?;
        serde_json::from_value(v).ok()
    }

    pub fn set_primary_route(&self, agent_id: &str, route: &Route) {
        match serde_json::to_value(route) {
            Ok(v) => self
                .kv
                .put(&format!("{PRIMARY_ROUTE_PREFIX}:{agent_id}"), v),
            Err(e) => tracing::warn!(error = %e, "failed to encode primary route"),
        }
    }
}
