//! Run requests and gateway jobs — the admission input and output shapes.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::inbound::{Peer, Route};
use crate::policy::ToolPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Origin & queue mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a run request entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Channel,
    ControlPlane,
    Cron,
    Node,
}

impl Origin {
    /// Scheduling lane derived from the origin.
    pub fn lane(&self) -> Lane {
        match self {
            Self::Channel => Lane::Chat,
            Self::ControlPlane => Lane::Control,
            Self::Cron => Lane::Cron,
            Self::Node => Lane::Node,
        }
    }
}

/// Scheduling lane a job runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Chat,
    Control,
    Cron,
    Node,
}

/// How a prompt queues against an in-flight run on the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Collect,
    Followup,
    Steer,
    SteerBacklog,
    Interrupt,
}

impl QueueMode {
    /// Case-insensitive parse against the allowed set.  Unknown input is
    /// `None`; callers pick their own default (never an error).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "collect" => Some(Self::Collect),
            "followup" => Some(Self::Followup),
            "steer" => Some(Self::Steer),
            "steer_backlog" | "steer-backlog" => Some(Self::SteerBacklog),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }

    pub fn parse_or(s: Option<&str>, default: Self) -> Self {
        s.and_then(Self::parse).unwrap_or(default)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resume tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strict resume line: `<engine> --resume <token>` (also `--resume=<token>`)
/// on a line of its own.  The resume footer on final answers is emitted in
/// this exact shape so it round-trips through the same parser.
fn resume_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([a-z][a-z0-9_-]*)\s+--resume(?:=|\s+)(\S+)\s*$").expect("valid regex")
    })
}

/// Engine-specific opaque handle that lets a later run continue a prior
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: String,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            value: value.into(),
        }
    }

    /// Parse a single strict resume line.
    pub fn parse_line(line: &str) -> Option<Self> {
        let caps = resume_line_re().captures(line)?;
        Some(Self::new(&caps[1], &caps[2]))
    }

    /// Scan text for strict resume lines.  The last one wins (footers sit
    /// at the bottom of a message).
    pub fn extract(text: &str) -> Option<Self> {
        text.lines().rev().find_map(Self::parse_line)
    }

    /// Remove all strict resume lines from a prompt, returning the stripped
    /// prompt and the extracted token (last line wins).
    pub fn strip_from(prompt: &str) -> (String, Option<Self>) {
        let mut token = None;
        let kept: Vec<&str> = prompt
            .lines()
            .filter(|line| match Self::parse_line(line) {
                Some(t) => {
                    token = Some(t);
                    false
                }
                None => true,
            })
            .collect();
        (kept.join("\n").trim().to_string(), token)
    }

    /// The footer line appended to final answers on channels that carry it.
    pub fn footer_line(&self) -> String {
        format!("{} --resume {}", self.engine, self.value)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Free-form metadata carried with a run request.  Typed fields for what
/// the core routes on; everything else flattens into `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMeta {
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub account_id: Option<String>,
    pub peer: Option<Peer>,
    /// The transport id of the user's message (reply anchor).
    pub user_msg_id: Option<String>,
    /// Pre-created progress message, when the channel chrome made one.
    pub progress_msg_id: Option<String>,
    pub status_msg_id: Option<String>,
    /// Text of the message being replied to (resume-footer recovery).
    pub reply_to_text: Option<String>,
    /// Transport id of the message being replied to (resume-index lookup).
    pub reply_to_id: Option<String>,
    pub voice_transcribed: bool,
    pub cwd: Option<String>,
    /// Additional delivery targets resolved by the inbox.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fanout_routes: Vec<Route>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Input to the orchestrator: a prompt bound for some session.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub origin: Origin,
    pub session_key: String,
    pub agent_id: Option<String>,
    pub prompt: String,
    pub queue_mode: Option<QueueMode>,
    pub engine_id: Option<String>,
    pub cwd: Option<String>,
    /// Operator policy override, layered last.
    pub tool_policy: Option<ToolPolicy>,
    pub meta: RequestMeta,
}

impl RunRequest {
    pub fn new(origin: Origin, session_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            origin,
            session_key: session_key.into(),
            agent_id: None,
            prompt: prompt.into(),
            queue_mode: None,
            engine_id: None,
            cwd: None,
            tool_policy: None,
            meta: RequestMeta::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolved metadata attached to a job, consumed by the run process and
/// the coalescers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMeta {
    pub origin: Option<Origin>,
    pub agent_id: String,
    pub thinking_level: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub channel_id: Option<String>,
    pub account_id: Option<String>,
    pub peer: Option<Peer>,
    pub progress_msg_id: Option<String>,
    pub status_msg_id: Option<String>,
    pub user_msg_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fanout_routes: Vec<Route>,
    #[serde(skip_serializing_if = "is_zero")]
    pub fanout_count: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// The resolved unit of work handed to the engine gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub run_id: String,
    pub session_key: String,
    pub prompt: String,
    pub engine_id: Option<String>,
    pub cwd: Option<String>,
    pub resume_token: Option<ResumeToken>,
    pub queue_mode: QueueMode,
    pub lane: Lane,
    pub tool_policy: ToolPolicy,
    pub meta: JobMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_parse_case_insensitive() {
        assert_eq!(QueueMode::parse("Collect"), Some(QueueMode::Collect));
        assert_eq!(QueueMode::parse("STEER"), Some(QueueMode::Steer));
        assert_eq!(
            QueueMode::parse("steer_backlog"),
            Some(QueueMode::SteerBacklog)
        );
        assert_eq!(QueueMode::parse("bogus"), None);
    }

    #[test]
    fn queue_mode_parse_or_falls_back() {
        assert_eq!(
            QueueMode::parse_or(Some("bogus"), QueueMode::Followup),
            QueueMode::Followup
        );
        assert_eq!(
            QueueMode::parse_or(None, QueueMode::Collect),
            QueueMode::Collect
        );
        assert_eq!(
            QueueMode::parse_or(Some("interrupt"), QueueMode::Collect),
            QueueMode::Interrupt
        );
    }

    #[test]
    fn resume_line_forms() {
        assert_eq!(
            ResumeToken::parse_line("codex --resume abc123"),
            Some(ResumeToken::new("codex", "abc123"))
        );
        assert_eq!(
            ResumeToken::parse_line("  claude --resume=tok-9 "),
            Some(ResumeToken::new("claude", "tok-9"))
        );
        assert_eq!(ResumeToken::parse_line("please resume abc"), None);
        assert_eq!(ResumeToken::parse_line("codex --resume"), None);
    }

    #[test]
    fn strip_removes_resume_lines_and_keeps_prompt() {
        let (stripped, token) =
            ResumeToken::strip_from("fix the bug\ncodex --resume tok1\nthanks");
        assert_eq!(stripped, "fix the bug\nthanks");
        assert_eq!(token, Some(ResumeToken::new("codex", "tok1")));
    }

    #[test]
    fn strip_last_resume_line_wins() {
        let (stripped, token) =
            ResumeToken::strip_from("codex --resume old\ncodex --resume new");
        assert!(stripped.is_empty());
        assert_eq!(token.unwrap().value, "new");
    }

    #[test]
    fn footer_round_trips_through_parser() {
        let token = ResumeToken::new("codex", "sess-42");
        assert_eq!(
            ResumeToken::parse_line(&token.footer_line()),
            Some(token)
        );
    }

    #[test]
    fn origin_lane_mapping() {
        assert_eq!(Origin::Channel.lane(), Lane::Chat);
        assert_eq!(Origin::ControlPlane.lane(), Lane::Control);
        assert_eq!(Origin::Cron.lane(), Lane::Cron);
        assert_eq!(Origin::Node.lane(), Lane::Node);
    }

    #[test]
    fn job_meta_extra_flattens() {
        let meta: JobMeta = serde_json::from_value(serde_json::json!({
            "agent_id": "a1",
            "custom_field": "x"
        }))
        .unwrap();
        assert_eq!(meta.agent_id, "a1");
        assert_eq!(meta.extra.get("custom_field").unwrap(), "x");
    }
}
