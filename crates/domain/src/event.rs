//! Event types flowing over the in-process bus.
//!
//! The bus carries a tagged sum: gateway run events, approval lifecycle,
//! service lifecycle, log lines, and a raw escape hatch.  Consumers match
//! the variants they understand and forward or ignore the rest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::job::ResumeToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage reported with a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Events the engine gateway emits on a run topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    RunStarted {
        run_id: String,
    },
    Delta {
        run_id: String,
        seq: u64,
        text: String,
    },
    EngineAction {
        run_id: String,
        action: ActionRecord,
    },
    RunCompleted {
        run_id: String,
        ok: bool,
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        resume: Option<ResumeToken>,
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        error: Option<Value>,
    },
    RunFailed {
        run_id: String,
        reason: String,
    },
}

impl GatewayEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id }
            | Self::Delta { run_id, .. }
            | Self::EngineAction { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }
}

/// Render an opaque completion error for matching and display.  String
/// errors render as themselves; anything else as compact JSON.
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine actions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tool,
    Command,
    FileChange,
    WebSearch,
    Subagent,
    /// High-volume thinking traces; filtered before status ingestion.
    Note,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

/// A file the engine asked to be forwarded to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSendFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Structured detail attached to an action.  Open-ended: unknown fields
/// land in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionDetail {
    pub args: Option<Value>,
    pub result_preview: Option<String>,
    pub changes: Option<Value>,
    /// Command-like actions: reported status and exit code.
    pub status: Option<String>,
    pub exit_code: Option<i64>,
    pub command: Option<String>,
    /// Subagent actions: engine / role / async transport annotations.
    pub engine: Option<String>,
    pub role: Option<String>,
    pub async_via: Option<String>,
    /// File-change actions: touched path and change kind.
    pub path: Option<String>,
    pub change_kind: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auto_send_files: Vec<AutoSendFile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One tool-action lifecycle record as rendered in the status message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    pub phase: ActionPhase,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub detail: ActionDetail,
    #[serde(default)]
    pub caller_engine: Option<String>,
}

impl ActionRecord {
    pub fn is_running(&self) -> bool {
        matches!(self.phase, ActionPhase::Started | ActionPhase::Updated)
    }

    /// Fold a newer record for the same id into this one.  Phase/ok always
    /// advance; newer detail fields override, absent ones are kept.
    pub fn absorb(&mut self, newer: ActionRecord) {
        self.phase = newer.phase;
        if newer.ok.is_some() {
            self.ok = newer.ok;
        }
        if !newer.title.is_empty() {
            self.title = newer.title;
        }
        if newer.caller_engine.is_some() {
            self.caller_engine = newer.caller_engine;
        }
        let d = newer.detail;
        macro_rules! take {
            ($($field:ident),*) => {
                $(if d.$field.is_some() { self.detail.$field = d.$field; })*
            };
        }
        take!(
            args,
            result_preview,
            changes,
            status,
            exit_code,
            command,
            engine,
            role,
            async_via,
            path,
            change_kind
        );
        if !d.auto_send_files.is_empty() {
            self.detail.auto_send_files = d.auto_send_files;
        }
        for (k, v) in d.extra {
            self.detail.extra.insert(k, v);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals & services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequested {
    pub approval_id: String,
    pub tool: String,
    pub action_hash: String,
    pub session_key: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResolved {
    pub approval_id: String,
    pub decision: String,
}

/// Service lifecycle telemetry re-emitted by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service: String,
    pub kind: String,
    #[serde(default)]
    pub detail: Value,
}

/// One line in a per-service ring log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub service: String,
    pub level: String,
    pub message: String,
    pub ts_ms: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The tagged sum of everything the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", content = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Gateway(GatewayEvent),
    ApprovalRequested(ApprovalRequested),
    ApprovalResolved(ApprovalResolved),
    Service(ServiceEvent),
    Log(LogLine),
    /// Unknown payloads pass through untouched.
    Raw(Value),
}
