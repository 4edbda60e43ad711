//! Inbound normalization and the agent inbox.
//!
//! `handle_inbound` turns a transport envelope into a run submit and
//! always returns ok so the transport does not retry at this layer.
//! `AgentInbox::send` adds the session-selection modes (latest / new /
//! explicit) and fanout delivery used by the control plane and cron.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use lemon_domain::event::{BusEvent, ServiceEvent};
use lemon_domain::{
    Error, InboundMessage, Origin, QueueMode, RequestMeta, Result, Route, RunRequest,
};
use lemon_sessions::{AgentDirectory, RouteFilter, SessionKey};

use crate::bus::{service_topic, SERVICES_TOPIC};
use crate::orchestrator::RunOrchestrator;
use crate::run::RunDeps;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dedupe store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory idempotency store for inbound events.  At-least-once
/// transports replay on reconnect; a replayed message id must not start a
/// second run.
pub struct DedupeStore {
    seen: parking_lot::Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: parking_lot::Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this event id was already seen (duplicate).
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if map.len() > 10_000 {
            map.retain(|_, ts| now.duration_since(*ts) < self.ttl);
        }

        if let Some(ts) = map.get(event_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }
        map.insert(event_id.to_owned(), now);
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEDUPE_TTL: Duration = Duration::from_secs(600);

pub struct Router {
    orchestrator: Arc<RunOrchestrator>,
    directory: Arc<AgentDirectory>,
    dedupe: DedupeStore,
}

impl Router {
    pub fn new(orchestrator: Arc<RunOrchestrator>, directory: Arc<AgentDirectory>) -> Self {
        Self {
            orchestrator,
            directory,
            dedupe: DedupeStore::new(DEDUPE_TTL),
        }
    }

    fn deps(&self) -> &RunDeps {
        self.orchestrator.deps()
    }

    /// Normalize and submit an inbound channel message.  Errors are
    /// logged, never returned: the transport must not retry here.
    pub async fn handle_inbound(&self, msg: InboundMessage) {
        if let Some(message_id) = msg.message.id.as_deref() {
            let event_id = format!("{}:{}:{message_id}", msg.channel_id, msg.account_id);
            if self.dedupe.check_and_insert(&event_id) {
                tracing::debug!(event_id = %event_id, "duplicate inbound dropped");
                return;
            }
        }

        let agent_id = msg
            .meta
            .agent_id
            .clone()
            .unwrap_or_else(|| "default".to_owned());
        let session_key = msg
            .meta
            .session_key
            .as_deref()
            .filter(|k| SessionKey::is_valid(k))
            .map(str::to_owned)
            .unwrap_or_else(|| {
                SessionKey::channel_peer(
                    agent_id.clone(),
                    msg.channel_id.clone(),
                    msg.account_id.clone(),
                    msg.peer.kind,
                    msg.peer.id.clone(),
                    msg.peer.thread_id.clone(),
                    None,
                )
                .to_string()
            });

        let queue_mode = QueueMode::parse_or(
            msg.meta.extra.get("queue_mode").and_then(Value::as_str),
            QueueMode::Collect,
        );

        let mut meta = msg.meta.clone();
        meta.channel_id = Some(msg.channel_id.clone());
        meta.account_id = Some(msg.account_id.clone());
        meta.peer = Some(msg.peer.clone());
        if meta.user_msg_id.is_none() {
            meta.user_msg_id = msg.message.id.clone();
        }
        if meta.reply_to_id.is_none() {
            meta.reply_to_id = msg.message.reply_to_id.clone();
        }

        let request = RunRequest {
            origin: Origin::Channel,
            session_key: session_key.clone(),
            agent_id: Some(agent_id),
            prompt: msg.message.text,
            queue_mode: Some(queue_mode),
            engine_id: None,
            cwd: None,
            tool_policy: None,
            meta,
        };

        if let Err(e) = self.orchestrator.submit(request).await {
            tracing::warn!(
                error = %e,
                session_key = %session_key,
                channel_id = %msg.channel_id,
                "inbound submit failed"
            );
        }
    }

    // ── Control plane ────────────────────────────────────────────────

    pub async fn handle_control_agent(
        &self,
        req: ControlAgentRequest,
    ) -> std::result::Result<ControlAgentReply, ControlError> {
        let selector = match req.session_key {
            Some(key) => SessionSelector::Explicit(key),
            None => SessionSelector::Latest,
        };
        let inbox = AgentInbox::new(self.orchestrator.clone(), self.directory.clone());
        let opts = SendOptions {
            session: selector,
            queue_mode: req.queue_mode,
            engine_id: req.engine_id,
            cwd: req.cwd,
            tool_policy: req.tool_policy,
            meta: req.meta.unwrap_or_default(),
            ..Default::default()
        };
        inbox
            .send(&req.agent_id, &req.prompt, opts)
            .await
            .map(|outcome| ControlAgentReply {
                run_id: outcome.run_id,
                session_key: outcome.session_key,
            })
            .map_err(ControlError::from)
    }

    // ── Abort ────────────────────────────────────────────────────────

    /// Abort every run registered on a session.  Returns how many aborts
    /// were cast.
    pub fn abort(&self, session_key: &str) -> usize {
        match self.deps().sessions.active(session_key) {
            Some(run_id) => usize::from(self.abort_run(&run_id)),
            None => 0,
        }
    }

    pub fn abort_run(&self, run_id: &str) -> bool {
        self.deps().runs.abort(run_id)
    }

    /// Resolve a cancel-button callback back to its run id.
    pub fn parse_cancel_callback(data: &str) -> Option<&str> {
        data.strip_prefix("lemon:cancel:")
    }

    // ── Service lifecycle re-emission ────────────────────────────────

    pub fn emit_service_event(&self, ev: ServiceEvent) {
        let bus = &self.deps().bus;
        bus.publish(&service_topic(&ev.service), BusEvent::Service(ev.clone()));
        bus.publish(SERVICES_TOPIC, BusEvent::Service(ev));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control-plane types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct ControlAgentRequest {
    pub agent_id: String,
    pub prompt: String,
    pub session_key: Option<String>,
    pub queue_mode: Option<String>,
    pub engine_id: Option<String>,
    pub cwd: Option<String>,
    pub tool_policy: Option<lemon_domain::ToolPolicy>,
    pub meta: Option<RequestMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlAgentReply {
    pub run_id: String,
    pub session_key: String,
}

/// Canonical control-plane failure: `SUBMIT_FAILED` with the error kind
/// in the details.
#[derive(Debug, Clone, Serialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl From<Error> for ControlError {
    fn from(e: Error) -> Self {
        Self {
            code: "SUBMIT_FAILED".to_owned(),
            message: e.to_string(),
            details: serde_json::json!({ "kind": e.kind() }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent inbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a send picks its session.
#[derive(Debug, Clone, Default)]
pub enum SessionSelector {
    /// Most recent session (optionally matching the `to` route); falls
    /// back to a route-derived key, then main.
    #[default]
    Latest,
    /// Fork a fresh sub-session off a base session.
    New { base_session_key: Option<String> },
    /// A literal session key; must belong to the agent.
    Explicit(String),
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub session: SessionSelector,
    /// Primary route target, e.g. `tg:111`.
    pub to: Option<String>,
    /// Additional delivery targets; duplicates of each other or of the
    /// primary are dropped.
    pub deliver_to: Vec<String>,
    pub queue_mode: Option<String>,
    pub engine_id: Option<String>,
    pub cwd: Option<String>,
    pub tool_policy: Option<lemon_domain::ToolPolicy>,
    pub origin: Option<Origin>,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub run_id: String,
    pub session_key: String,
}

pub struct AgentInbox {
    orchestrator: Arc<RunOrchestrator>,
    directory: Arc<AgentDirectory>,
}

impl AgentInbox {
    pub fn new(orchestrator: Arc<RunOrchestrator>, directory: Arc<AgentDirectory>) -> Self {
        Self {
            orchestrator,
            directory,
        }
    }

    pub async fn send(
        &self,
        agent_id: &str,
        prompt: &str,
        opts: SendOptions,
    ) -> Result<SendOutcome> {
        if agent_id.trim().is_empty() {
            return Err(Error::InvalidSubmitter("empty agent id".to_owned()));
        }
        let primary_route = match opts.to.as_deref() {
            Some(target) => Some(Route::parse_target(target)?),
            None => None,
        };

        let session_key =
            self.select_session(agent_id, &opts.session, primary_route.as_ref())?;

        let mut meta = opts.meta;
        let fanout = self.resolve_fanout(&opts.deliver_to, primary_route.as_ref())?;
        if !fanout.is_empty() {
            meta.fanout_routes = fanout;
        }

        let queue_mode = QueueMode::parse_or(opts.queue_mode.as_deref(), QueueMode::Followup);

        let request = RunRequest {
            origin: opts.origin.unwrap_or(Origin::ControlPlane),
            session_key: session_key.clone(),
            agent_id: Some(agent_id.to_owned()),
            prompt: prompt.to_owned(),
            queue_mode: Some(queue_mode),
            engine_id: opts.engine_id,
            cwd: opts.cwd,
            tool_policy: opts.tool_policy,
            meta,
        };
        let run_id = self.orchestrator.submit(request).await?;
        Ok(SendOutcome {
            run_id,
            session_key,
        })
    }

    fn select_session(
        &self,
        agent_id: &str,
        selector: &SessionSelector,
        primary_route: Option<&Route>,
    ) -> Result<String> {
        match selector {
            SessionSelector::Latest => Ok(self.latest_session(agent_id, primary_route)),
            SessionSelector::New { base_session_key } => {
                self.fork_session(agent_id, base_session_key.as_deref(), primary_route)
            }
            SessionSelector::Explicit(key) => {
                let parsed = SessionKey::parse(key)
                    .map_err(|_| Error::InvalidSessionSelector(key.clone()))?;
                if parsed.agent_id() != agent_id {
                    return Err(Error::SessionAgentMismatch {
                        session_key: key.clone(),
                        owner: parsed.agent_id().to_owned(),
                        agent_id: agent_id.to_owned(),
                    });
                }
                Ok(parsed.to_string())
            }
        }
    }

    fn latest_session(&self, agent_id: &str, route: Option<&Route>) -> String {
        let filter = route.map(route_filter).unwrap_or_default();
        if let Some(key) = self.directory.latest_matching(agent_id, &filter) {
            return key;
        }
        if let Some(route) = route.cloned().or_else(|| self.directory.primary_route(agent_id)) {
            return SessionKey::from_route(agent_id, &route).to_string();
        }
        SessionKey::main(agent_id).to_string()
    }

    /// Resolve a base session and fork it into a fresh sub-session.
    fn fork_session(
        &self,
        agent_id: &str,
        base: Option<&str>,
        primary_route: Option<&Route>,
    ) -> Result<String> {
        let base_key = if let Some(base) = base {
            SessionKey::parse(base)
                .map_err(|_| Error::InvalidSessionSelector(base.to_owned()))?
        } else if let Some(route) = primary_route
            .cloned()
            .or_else(|| self.directory.primary_route(agent_id))
        {
            SessionKey::from_route(agent_id, &route)
        } else if let Some(key) = self
            .directory
            .latest_with_route(agent_id)
            .or_else(|| self.directory.latest(agent_id))
        {
            SessionKey::parse(&key).map_err(|_| Error::InvalidSessionSelector(key))?
        } else {
            SessionKey::main(agent_id)
        };

        // Channel sessions fork to a route key with a fresh sub id; main
        // stays main.
        let forked = match base_key.route() {
            Some(route) => SessionKey::from_route(agent_id, &route).fork(),
            None => SessionKey::main(agent_id),
        };
        Ok(forked.to_string())
    }

    /// Drop duplicate fanout targets (by route signature) and the primary
    /// itself.
    fn resolve_fanout(
        &self,
        deliver_to: &[String],
        primary: Option<&Route>,
    ) -> Result<Vec<Route>> {
        let mut seen: HashSet<String> = HashSet::new();
        if let Some(primary) = primary {
            seen.insert(primary.signature());
        }
        let mut routes = Vec::new();
        for target in deliver_to {
            let route = Route::parse_target(target)?;
            if seen.insert(route.signature()) {
                routes.push(route);
            }
        }
        Ok(routes)
    }
}

fn route_filter(route: &Route) -> RouteFilter {
    RouteFilter {
        channel_id: Some(route.channel_id.clone()),
        account_id: Some(route.account_id.clone()),
        peer_id: Some(route.peer_id.clone()),
    }
}
