//! Shared test fixtures: a scripted engine gateway and a fully wired
//! routing world over in-memory stores.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use lemon_domain::event::{BusEvent, GatewayEvent, Usage};
use lemon_domain::inbound::{InboundMessage, MessageBody, Peer, PeerKind};
use lemon_domain::{Job, RequestMeta, ResumeToken, RouterConfig};
use lemon_router::adapter::ChannelAdapterRegistry;
use lemon_router::bus::{run_topic, EventBus};
use lemon_router::gateway::{DownReason, EngineGateway, EngineRegistry, GatewayError, GatewayRun};
use lemon_router::orchestrator::RunOrchestrator;
use lemon_router::profile::{AgentProfile, AgentProfiles, SessionPolicies};
use lemon_router::router::Router;
use lemon_router::run::supervisor::{RunRegistry, RunSupervisor};
use lemon_router::run::RunDeps;
use lemon_router::{
    AgentInbox, MemoryOutbox, StatusCoalescers, StreamCoalescers, TelegramAdapter, TelegramState,
};
use lemon_sessions::{AgentDirectory, MemoryKv, SessionRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MockGateway {
    bus: EventBus,
    submitted: Mutex<Vec<Job>>,
    cancelled: Mutex<Vec<String>>,
    downs: Mutex<HashMap<String, oneshot::Sender<DownReason>>>,
    available: AtomicBool,
}

impl MockGateway {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            downs: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<Job> {
        self.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Emit a gateway event on the run topic.
    pub fn emit(&self, ev: GatewayEvent) {
        self.bus
            .publish(&run_topic(ev.run_id()), BusEvent::Gateway(ev));
    }

    pub fn emit_started(&self, run_id: &str) {
        self.emit(GatewayEvent::RunStarted {
            run_id: run_id.to_owned(),
        });
    }

    pub fn emit_delta(&self, run_id: &str, seq: u64, text: &str) {
        self.emit(GatewayEvent::Delta {
            run_id: run_id.to_owned(),
            seq,
            text: text.to_owned(),
        });
    }

    pub fn emit_completed(&self, run_id: &str, ok: bool, answer: &str) {
        self.complete(run_id, ok, Some(answer.to_owned()), None, None, None);
    }

    pub fn complete(
        &self,
        run_id: &str,
        ok: bool,
        answer: Option<String>,
        resume: Option<ResumeToken>,
        usage: Option<Usage>,
        error: Option<serde_json::Value>,
    ) {
        // Completion resolves the monitor cleanly too.
        if let Some(down) = self.downs.lock().remove(run_id) {
            let _ = down.send(DownReason::Normal);
        }
        self.emit(GatewayEvent::RunCompleted {
            run_id: run_id.to_owned(),
            ok,
            answer,
            resume,
            usage,
            error,
        });
    }

    /// Kill the run actor without a completion.
    pub fn kill_run(&self, run_id: &str, reason: DownReason) {
        if let Some(down) = self.downs.lock().remove(run_id) {
            let _ = down.send(reason);
        }
    }
}

#[async_trait]
impl EngineGateway for MockGateway {
    async fn submit(&self, job: &Job) -> Result<GatewayRun, GatewayError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable);
        }
        let (tx, rx) = oneshot::channel();
        self.downs.lock().insert(job.run_id.clone(), tx);
        self.submitted.lock().push(job.clone());
        Ok(GatewayRun {
            run_ref: Uuid::new_v4(),
            down: rx,
        })
    }

    fn cancel(&self, run_id: &str) {
        self.cancelled.lock().push(run_id.to_owned());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// World
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct World {
    pub deps: RunDeps,
    pub orchestrator: Arc<RunOrchestrator>,
    pub router: Router,
    pub inbox: AgentInbox,
    pub outbox: Arc<MemoryOutbox>,
    pub gateway: Arc<MockGateway>,
    pub kv: Arc<MemoryKv>,
    pub telegram: Arc<TelegramState>,
    pub directory: Arc<AgentDirectory>,
    pub profiles: Arc<AgentProfiles>,
}

/// Wire the full routing world over in-memory stores.  Must run inside a
/// tokio runtime (the telegram adapter spawns its ack listener).
pub fn build_world(config: RouterConfig) -> World {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let bus = EventBus::new();
    let kv = Arc::new(MemoryKv::new());
    let telegram = Arc::new(TelegramState::new(kv.clone()));
    let outbox = Arc::new(MemoryOutbox::new());
    let gateway = Arc::new(MockGateway::new(bus.clone()));

    let adapters = Arc::new(ChannelAdapterRegistry::new());
    adapters.register(Arc::new(TelegramAdapter::new(
        telegram.clone(),
        config.telegram.clone(),
    )));

    let engines = Arc::new(EngineRegistry::new());
    engines.register("codex", None);

    let config = Arc::new(config);
    let streams = Arc::new(StreamCoalescers::new(
        adapters.clone(),
        outbox.clone(),
        config.coalescer.clone(),
    ));
    let statuses = Arc::new(StatusCoalescers::new(
        adapters.clone(),
        outbox.clone(),
        config.coalescer.clone(),
    ));

    let deps = RunDeps {
        bus,
        gateway: gateway.clone(),
        engines,
        adapters,
        outbox: outbox.clone(),
        sessions: Arc::new(SessionRegistry::new()),
        runs: Arc::new(RunRegistry::new()),
        supervisor: Arc::new(RunSupervisor::new(config.runs.max_concurrent)),
        streams,
        statuses,
        telegram: telegram.clone(),
        config,
    };

    let profiles = Arc::new(AgentProfiles::new());
    profiles.insert(AgentProfile::new("default"));
    profiles.insert(AgentProfile::new("agent-x"));

    let policies = Arc::new(SessionPolicies::new(kv.clone()));
    let directory = Arc::new(AgentDirectory::new(kv.clone()));
    let orchestrator = Arc::new(RunOrchestrator::new(
        deps.clone(),
        profiles.clone(),
        policies,
        directory.clone(),
    ));
    let router = Router::new(orchestrator.clone(), directory.clone());
    let inbox = AgentInbox::new(orchestrator.clone(), directory.clone());

    World {
        deps,
        orchestrator,
        router,
        inbox,
        outbox,
        gateway,
        kv,
        telegram,
        directory,
        profiles,
    }
}

pub fn default_world() -> World {
    build_world(RouterConfig::default())
}

/// A telegram DM inbound message.
pub fn telegram_inbound(agent_id: &str, chat_id: &str, msg_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        channel_id: "telegram".into(),
        account_id: "default".into(),
        peer: Peer {
            kind: PeerKind::Dm,
            id: chat_id.into(),
            thread_id: None,
        },
        sender: None,
        message: MessageBody {
            id: Some(msg_id.into()),
            text: text.into(),
            timestamp: None,
            reply_to_id: None,
        },
        raw: serde_json::Value::Null,
        meta: RequestMeta {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        },
    }
}

/// Let spawned tasks and timers make progress under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Settle past every coalescer timer.
pub async fn settle_long() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}
