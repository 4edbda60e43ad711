/// Shared error type used across all lemon crates.
///
/// Validation errors return synchronously from `submit`/`send`; transport
/// errors (`Duplicate`, `OutboxUnavailable`) are success-equivalent or
/// logged-and-dropped at the call site, never escalated into a run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // ── Input validation ─────────────────────────────────────────────
    #[error("empty prompt")]
    EmptyPrompt,

    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),

    #[error("invalid session selector: {0}")]
    InvalidSessionSelector(String),

    #[error("session {session_key} belongs to agent {owner}, not {agent_id}")]
    SessionAgentMismatch {
        session_key: String,
        owner: String,
        agent_id: String,
    },

    #[error("invalid fanout target: {0}")]
    InvalidFanoutTarget(String),

    #[error("unknown agent id: {0}")]
    UnknownAgentId(String),

    // ── Admission ────────────────────────────────────────────────────
    #[error("run capacity reached")]
    RunCapacityReached,

    #[error("router not ready")]
    RouterNotReady,

    #[error("invalid submitter: {0}")]
    InvalidSubmitter(String),

    // ── Approvals ────────────────────────────────────────────────────
    #[error("approval timed out")]
    ApprovalTimeout,

    // ── Transport ────────────────────────────────────────────────────
    /// An idempotency key was enqueued twice.  Treated as success.
    #[error("duplicate")]
    Duplicate,

    #[error("channels outbox unavailable")]
    OutboxUnavailable,

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable snake_case kind used in control-plane error details.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "empty_prompt",
            Self::InvalidPrompt(_) => "invalid_prompt",
            Self::InvalidSessionKey(_) => "invalid_session_key",
            Self::InvalidSessionSelector(_) => "invalid_session_selector",
            Self::SessionAgentMismatch { .. } => "session_agent_mismatch",
            Self::InvalidFanoutTarget(_) => "invalid_fanout_target",
            Self::UnknownAgentId(_) => "unknown_agent_id",
            Self::RunCapacityReached => "run_capacity_reached",
            Self::RouterNotReady => "router_not_ready",
            Self::InvalidSubmitter(_) => "invalid_submitter",
            Self::ApprovalTimeout => "timeout",
            Self::Duplicate => "duplicate",
            Self::OutboxUnavailable => "channels_outbox_unavailable",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
