//! The engine gateway boundary — a black-box job submitter that emits an
//! event stream per run on the bus.
//!
//! Run-actor monitoring is modelled by the `down` oneshot on
//! [`GatewayRun`]: the gateway resolves it (or drops the sender) when the
//! run actor exits.  A run process that sees DOWN without a completion
//! synthesizes one after a short grace.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use uuid::Uuid;

use lemon_domain::config::CompactionConfig;
use lemon_domain::Job;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a gateway run actor went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownReason {
    Normal,
    Shutdown,
    Crash(String),
}

impl DownReason {
    /// Clean exits get the longer completion grace; crashes get almost
    /// none.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Normal | Self::Shutdown)
    }
}

impl std::fmt::Display for DownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Crash(reason) => write!(f, "crash: {reason}"),
        }
    }
}

/// Handle to a submitted run inside the gateway.
pub struct GatewayRun {
    pub run_ref: Uuid,
    /// Resolves (or closes) when the gateway's run actor exits.
    pub down: oneshot::Receiver<DownReason>,
}

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// The gateway is not up yet; the submit will be retried.
    #[error("gateway unavailable")]
    Unavailable,
    #[error("gateway rejected job: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Submit a job.  Events for it arrive on `run:<run_id>`.
    async fn submit(&self, job: &Job) -> Result<GatewayRun, GatewayError>;

    /// Best-effort cancel by run id.  The gateway is expected to emit a
    /// completion afterwards.
    fn cancel(&self, run_id: &str);

    /// Default working directory for jobs that resolved none.
    fn default_cwd(&self) -> Option<String> {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `codex` engine's context window when nothing else says otherwise.
const CODEX_CONTEXT_WINDOW: u64 = 400_000;

#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub id: String,
    pub context_window: Option<u64>,
}

/// Registered engine ids with optional context-window hints.  A model
/// string is treated as an engine only when its prefix-before-`:` is
/// registered here.
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, EngineInfo>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, context_window: Option<u64>) {
        let id = id.into();
        self.engines.write().insert(
            id.clone(),
            EngineInfo {
                id,
                context_window,
            },
        );
    }

    pub fn is_engine(&self, id: &str) -> bool {
        self.engines.read().contains_key(id)
    }

    /// The engine a model string names, when its prefix is registered
    /// (e.g. `codex:o4-mini` → `codex`).
    pub fn engine_for_model(&self, model: &str) -> Option<String> {
        let prefix = model.split(':').next()?;
        if self.is_engine(prefix) {
            Some(prefix.to_owned())
        } else {
            None
        }
    }

    /// Resolve a context window: config override → registry hint →
    /// engine heuristic.
    pub fn resolve_context_window(
        &self,
        cfg: &CompactionConfig,
        model: Option<&str>,
        engine_id: Option<&str>,
    ) -> Option<u64> {
        if let Some(model) = model {
            if let Some(window) = cfg.context_windows.get(model) {
                return Some(*window);
            }
        }
        if let Some(engine) = engine_id {
            if let Some(info) = self.engines.read().get(engine) {
                if let Some(window) = info.context_window {
                    return Some(window);
                }
            }
            if engine == "codex" {
                return Some(CODEX_CONTEXT_WINDOW);
            }
        }
        None
    }
}
