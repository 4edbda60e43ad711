//! Exec approvals — a scoped, persisted consent store gating tool
//! execution.
//!
//! A request blocks (cooperatively) until a matching approval exists, a
//! reviewer resolves it, or it expires.  Lookup precedence is
//! global → node → agent → session; at each scope the exact action hash or
//! the `:any` wildcard matches.  `approve_once` and `deny` never persist.
//! Resolution persists first and wakes the waiter second, so a decision
//! made after the waiter died still sticks for non-once scopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use uuid::Uuid;

use lemon_domain::event::{ApprovalRequested, ApprovalResolved, BusEvent};
use lemon_sessions::{KvStore, SessionKey};

use crate::bus::{EventBus, APPROVALS_TOPIC};

/// Wildcard action hash: matches any action for a tool.
pub const ANY_ACTION: &str = ":any";

const KEY_PREFIX: &str = "exec_approval";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    Global,
    Node,
    Agent,
    Session,
    /// One-shot grant; never persisted.
    Once,
}

impl ApprovalScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Node => "node",
            Self::Agent => "agent",
            Self::Session => "session",
            Self::Once => "once",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    ApproveOnce,
    ApproveSession,
    ApproveAgent,
    ApproveGlobal,
    Deny,
}

impl ApprovalDecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve_once" => Some(Self::ApproveOnce),
            "approve_session" => Some(Self::ApproveSession),
            "approve_agent" => Some(Self::ApproveAgent),
            "approve_global" => Some(Self::ApproveGlobal),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveOnce => "approve_once",
            Self::ApproveSession => "approve_session",
            Self::ApproveAgent => "approve_agent",
            Self::ApproveGlobal => "approve_global",
            Self::Deny => "deny",
        }
    }

    fn scope(&self) -> Option<ApprovalScope> {
        match self {
            Self::ApproveOnce => Some(ApprovalScope::Once),
            Self::ApproveSession => Some(ApprovalScope::Session),
            Self::ApproveAgent => Some(ApprovalScope::Agent),
            Self::ApproveGlobal => Some(ApprovalScope::Global),
            Self::Deny => None,
        }
    }
}

/// Parameters of an approval request.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool: String,
    pub action: Value,
    pub session_key: String,
    /// Defaults to the session key's agent when absent.
    pub agent_id: Option<String>,
    pub node_id: Option<String>,
    pub expires_in_ms: Option<u64>,
}

/// What the waiter gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { scope: ApprovalScope },
    Denied,
    TimedOut,
}

struct Pending {
    tool: String,
    action_hash: String,
    session_key: String,
    agent_id: Option<String>,
    node_id: Option<String>,
    respond: oneshot::Sender<ApprovalDecision>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action hashing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// First 16 hex chars of SHA-256 over a canonical encoding of the action.
/// Objects are encoded with recursively sorted keys; non-map actions hash
/// over their debug rendering.
pub fn action_hash(action: &Value) -> String {
    let encoded = match action {
        Value::Object(_) => canonical_json(action),
        other => format!("{other:?}"),
    };
    let digest = Sha256::digest(encoded.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let encoded: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", encoded.join(","))
        }
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Approvals {
    kv: Arc<dyn KvStore>,
    bus: EventBus,
    pending: Mutex<HashMap<String, Pending>>,
    default_expires_ms: u64,
}

impl Approvals {
    pub fn new(kv: Arc<dyn KvStore>, bus: EventBus, default_expires_ms: u64) -> Self {
        Self {
            kv,
            bus,
            pending: Mutex::new(HashMap::new()),
            default_expires_ms,
        }
    }

    /// Persisted-key schema.  Bit-stable for external admin tooling:
    /// `exec_approval:{scope}:{scope_id}:{tool}:{hash}`, scope_id `-` for
    /// global.
    fn storage_key(scope: ApprovalScope, scope_id: &str, tool: &str, hash: &str) -> String {
        let id = match scope {
            ApprovalScope::Global => "-",
            _ => scope_id,
        };
        format!("{KEY_PREFIX}:{}:{id}:{tool}:{hash}", scope.as_str())
    }

    fn lookup_scope(
        &self,
        scope: ApprovalScope,
        scope_id: &str,
        tool: &str,
        hash: &str,
    ) -> bool {
        self.kv
            .get(&Self::storage_key(scope, scope_id, tool, hash))
            .is_some()
            || self
                .kv
                .get(&Self::storage_key(scope, scope_id, tool, ANY_ACTION))
                .is_some()
    }

    /// Check the persisted scopes in precedence order.
    fn existing_approval(
        &self,
        tool: &str,
        hash: &str,
        session_key: &str,
        agent_id: Option<&str>,
        node_id: Option<&str>,
    ) -> Option<ApprovalScope> {
        if self.lookup_scope(ApprovalScope::Global, "-", tool, hash) {
            return Some(ApprovalScope::Global);
        }
        if let Some(node) = node_id {
            if self.lookup_scope(ApprovalScope::Node, node, tool, hash) {
                return Some(ApprovalScope::Node);
            }
        }
        if let Some(agent) = agent_id {
            if self.lookup_scope(ApprovalScope::Agent, agent, tool, hash) {
                return Some(ApprovalScope::Agent);
            }
        }
        if self.lookup_scope(ApprovalScope::Session, session_key, tool, hash) {
            return Some(ApprovalScope::Session);
        }
        None
    }

    /// Block until approved, denied, or expired.
    pub async fn request(&self, req: ApprovalRequest) -> ApprovalOutcome {
        let hash = action_hash(&req.action);
        let agent_id = req
            .agent_id
            .clone()
            .or_else(|| SessionKey::agent_of(&req.session_key));

        if let Some(scope) = self.existing_approval(
            &req.tool,
            &hash,
            &req.session_key,
            agent_id.as_deref(),
            req.node_id.as_deref(),
        ) {
            return ApprovalOutcome::Approved { scope };
        }

        let approval_id = Uuid::new_v4().to_string();
        let expires_in = req.expires_in_ms.unwrap_or(self.default_expires_ms);
        let expires_at_ms = chrono::Utc::now().timestamp_millis() + expires_in as i64;
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            approval_id.clone(),
            Pending {
                tool: req.tool.clone(),
                action_hash: hash.clone(),
                session_key: req.session_key.clone(),
                agent_id,
                node_id: req.node_id.clone(),
                respond: tx,
            },
        );

        self.bus.publish(
            APPROVALS_TOPIC,
            BusEvent::ApprovalRequested(ApprovalRequested {
                approval_id: approval_id.clone(),
                tool: req.tool.clone(),
                action_hash: hash,
                session_key: req.session_key.clone(),
                expires_at_ms,
            }),
        );

        match tokio::time::timeout(Duration::from_millis(expires_in), rx).await {
            Ok(Ok(decision)) => match decision.scope() {
                Some(scope) => ApprovalOutcome::Approved { scope },
                None => ApprovalOutcome::Denied,
            },
            // Resolver side dropped without answering: pending is gone.
            Ok(Err(_)) => ApprovalOutcome::TimedOut,
            Err(_) => {
                self.pending.lock().remove(&approval_id);
                ApprovalOutcome::TimedOut
            }
        }
    }

    /// Resolve a pending approval.  No-op (returns false) when the id is
    /// unknown.  Persists before waking the waiter.
    pub fn resolve(&self, approval_id: &str, decision: ApprovalDecision) -> bool {
        let Some(pending) = self.pending.lock().remove(approval_id) else {
            return false;
        };

        if let Some(scope) = decision.scope() {
            if scope != ApprovalScope::Once {
                self.persist(&pending, scope);
            }
        }

        if pending.respond.send(decision).is_err() {
            tracing::debug!(approval_id, "approval waiter gone; decision persisted only");
        }

        self.bus.publish(
            APPROVALS_TOPIC,
            BusEvent::ApprovalResolved(ApprovalResolved {
                approval_id: approval_id.to_owned(),
                decision: decision.as_str().to_owned(),
            }),
        );
        true
    }

    fn persist(&self, pending: &Pending, scope: ApprovalScope) {
        let scope_id = match scope {
            ApprovalScope::Global => "-",
            ApprovalScope::Node => pending.node_id.as_deref().unwrap_or("-"),
            ApprovalScope::Agent => pending.agent_id.as_deref().unwrap_or("-"),
            ApprovalScope::Session => pending.session_key.as_str(),
            ApprovalScope::Once => return,
        };
        let key = Self::storage_key(scope, scope_id, &pending.tool, &pending.action_hash);
        self.kv.put(
            &key,
            json!({
                "approved": true,
                "approved_at_ms": chrono::Utc::now().timestamp_millis(),
                "scope": scope.as_str(),
            }),
        );
    }

    /// Grant a wildcard approval directly (admin surface).
    pub fn grant_any(&self, scope: ApprovalScope, scope_id: &str, tool: &str) {
        let key = Self::storage_key(scope, scope_id, tool, ANY_ACTION);
        self.kv.put(
            &key,
            json!({
                "approved": true,
                "approved_at_ms": chrono::Utc::now().timestamp_millis(),
                "scope": scope.as_str(),
            }),
        );
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemon_sessions::MemoryKv;

    fn approvals() -> (Arc<Approvals>, Arc<MemoryKv>, EventBus) {
        let kv = Arc::new(MemoryKv::new());
        let bus = EventBus::new();
        let store = Arc::new(Approvals::new(kv.clone(), bus.clone(), 300_000));
        (store, kv, bus)
    }

    fn req(tool: &str, session_key: &str) -> ApprovalRequest {
        ApprovalRequest {
            tool: tool.into(),
            action: json!({"command": "rm -rf /tmp/x"}),
            session_key: session_key.into(),
            agent_id: None,
            node_id: None,
            expires_in_ms: Some(500),
        }
    }

    #[test]
    fn hash_is_16_hex_chars_and_stable() {
        let h1 = action_hash(&json!({"b": 2, "a": 1}));
        let h2 = action_hash(&json!({"a": 1, "b": 2}));
        assert_eq!(h1, h2, "key order must not change the hash");
        assert_eq!(h1.len(), 16);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_differs_for_different_actions() {
        assert_ne!(
            action_hash(&json!({"command": "ls"})),
            action_hash(&json!({"command": "rm"}))
        );
    }

    #[test]
    fn non_map_actions_hash_via_debug_form() {
        let h = action_hash(&json!("ls -la"));
        assert_eq!(h.len(), 16);
        assert_ne!(h, action_hash(&json!(["ls", "-la"])));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let a = canonical_json(&json!({"z": {"b": 1, "a": 2}, "x": [1, 2]}));
        assert_eq!(a, r#"{"x":[1,2],"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn storage_key_schema_is_bit_stable() {
        assert_eq!(
            Approvals::storage_key(ApprovalScope::Global, "ignored", "bash", "abc"),
            "exec_approval:global:-:bash:abc"
        );
        assert_eq!(
            Approvals::storage_key(ApprovalScope::Session, "agent:s1:main", "bash", "abc"),
            "exec_approval:session:agent:s1:main:bash:abc"
        );
    }

    #[tokio::test]
    async fn approve_session_persists_and_short_circuits() {
        let (store, kv, bus) = approvals();
        let mut sub = bus.subscribe(APPROVALS_TOPIC);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.request(req("bash", "agent:s1:main")).await })
        };

        // First event is the broadcast request.
        let approval_id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => {
                assert_eq!(ev.tool, "bash");
                ev.approval_id
            }
            other => panic!("expected request, got {other:?}"),
        };

        assert!(store.resolve(&approval_id, ApprovalDecision::ApproveSession));
        assert_eq!(
            waiter.await.unwrap(),
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Session
            }
        );

        // A persisted record exists under the session scope.
        let hash = action_hash(&json!({"command": "rm -rf /tmp/x"}));
        let key = Approvals::storage_key(ApprovalScope::Session, "agent:s1:main", "bash", &hash);
        assert_eq!(kv.get(&key).unwrap()["approved"], true);

        // An identical request now returns immediately.
        assert_eq!(
            store.request(req("bash", "agent:s1:main")).await,
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Session
            }
        );
    }

    #[tokio::test]
    async fn deny_resolves_without_persisting() {
        let (store, kv, bus) = approvals();
        let mut sub = bus.subscribe(APPROVALS_TOPIC);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.request(req("bash", "agent:s1:main")).await })
        };
        let approval_id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => ev.approval_id,
            other => panic!("unexpected {other:?}"),
        };
        store.resolve(&approval_id, ApprovalDecision::Deny);
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Denied);
        assert!(kv.keys_with_prefix(KEY_PREFIX).is_empty());
    }

    #[tokio::test]
    async fn approve_once_never_persists() {
        let (store, kv, bus) = approvals();
        let mut sub = bus.subscribe(APPROVALS_TOPIC);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.request(req("bash", "agent:s1:main")).await })
        };
        let approval_id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => ev.approval_id,
            other => panic!("unexpected {other:?}"),
        };
        store.resolve(&approval_id, ApprovalDecision::ApproveOnce);
        assert_eq!(
            waiter.await.unwrap(),
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Once
            }
        );
        assert!(kv.keys_with_prefix(KEY_PREFIX).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_clears_pending() {
        let (store, _kv, _bus) = approvals();
        let outcome = store.request(req("bash", "agent:s1:main")).await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
        assert!(store.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_noop() {
        let (store, _kv, _bus) = approvals();
        assert!(!store.resolve("nope", ApprovalDecision::ApproveGlobal));
    }

    #[tokio::test]
    async fn wildcard_matches_any_action() {
        let (store, _kv, _bus) = approvals();
        store.grant_any(ApprovalScope::Global, "-", "bash");
        let outcome = store
            .request(ApprovalRequest {
                action: json!({"command": "anything at all"}),
                ..req("bash", "agent:s1:main")
            })
            .await;
        assert_eq!(
            outcome,
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Global
            }
        );
    }

    #[tokio::test]
    async fn scope_precedence_global_wins() {
        let (store, _kv, bus) = approvals();
        // Persist both a session and a global grant for the same action.
        let mut sub = bus.subscribe(APPROVALS_TOPIC);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.request(req("bash", "agent:s1:main")).await })
        };
        let id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => ev.approval_id,
            other => panic!("unexpected {other:?}"),
        };
        store.resolve(&id, ApprovalDecision::ApproveSession);
        waiter.await.unwrap();
        store.grant_any(ApprovalScope::Global, "-", "bash");

        assert_eq!(
            store.request(req("bash", "agent:s1:main")).await,
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Global
            }
        );
    }

    #[tokio::test]
    async fn agent_scope_derived_from_session_key() {
        let (store, kv, bus) = approvals();
        let mut sub = bus.subscribe(APPROVALS_TOPIC);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .request(req("bash", "agent:planner:telegram:default:dm:1"))
                    .await
            })
        };
        let id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => ev.approval_id,
            other => panic!("unexpected {other:?}"),
        };
        store.resolve(&id, ApprovalDecision::ApproveAgent);
        waiter.await.unwrap();

        let hash = action_hash(&json!({"command": "rm -rf /tmp/x"}));
        let key = Approvals::storage_key(ApprovalScope::Agent, "planner", "bash", &hash);
        assert!(kv.get(&key).is_some(), "agent-scope record persisted");

        // Any session of the same agent now matches.
        assert_eq!(
            store
                .request(req("bash", "agent:planner:telegram:default:dm:99"))
                .await,
            ApprovalOutcome::Approved {
                scope: ApprovalScope::Agent
            }
        );
    }

    #[tokio::test]
    async fn resolve_after_waiter_death_still_persists() {
        let (store, kv, bus) = approvals();
        let mut sub = bus.subscribe(APPROVALS_TOPIC);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .request(ApprovalRequest {
                        expires_in_ms: Some(60_000),
                        ..req("bash", "agent:s1:main")
                    })
                    .await
            })
        };
        let id = match sub.rx.recv().await.unwrap() {
            BusEvent::ApprovalRequested(ev) => ev.approval_id,
            other => panic!("unexpected {other:?}"),
        };
        waiter.abort();
        let _ = waiter.await;

        assert!(store.resolve(&id, ApprovalDecision::ApproveSession));
        let hash = action_hash(&json!({"command": "rm -rf /tmp/x"}));
        let key = Approvals::storage_key(ApprovalScope::Session, "agent:s1:main", "bash", &hash);
        assert!(kv.get(&key).is_some(), "persistence-first ordering");
    }
}
