//! Telegram per-chat state over the opaque key/value store: resume
//! indices, selected-resume, chat state, and pending-compaction marks.
//!
//! All of the resume-related entries for a chat are cleared as a unit when
//! a run dies on context overflow, so the next message starts fresh.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use lemon_domain::ResumeToken;
use lemon_sessions::KvStore;

const CHAT_STATE: &str = "telegram_chat_state";
const SELECTED_RESUME: &str = "telegram_selected_resume";
const MSG_RESUME: &str = "telegram_msg_resume";
const MSG_SESSION: &str = "telegram_msg_session";
const PENDING_COMPACTION: &str = "telegram_pending_compaction";

/// Why a chat was marked for compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    Overflow,
    NearLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCompaction {
    pub reason: CompactionReason,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub threshold_tokens: Option<u64>,
    #[serde(default)]
    pub context_window_tokens: Option<u64>,
}

pub struct TelegramState {
    kv: Arc<dyn KvStore>,
}

impl TelegramState {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    // ── Resume indices ───────────────────────────────────────────────

    /// Remember that replies to `msg_id` should resume `token` within
    /// `session_key`.
    pub fn index_resume(&self, chat_id: &str, msg_id: &str, token: &ResumeToken, session_key: &str) {
        if let Ok(v) = serde_json::to_value(token) {
            self.kv.put(&format!("{MSG_RESUME}:{chat_id}:{msg_id}"), v);
        }
        self.kv.put(
            &format!("{MSG_SESSION}:{chat_id}:{msg_id}"),
            json!(session_key),
        );
    }

    pub fn resume_for_reply(&self, chat_id: &str, msg_id: &str) -> Option<ResumeToken> {
        let v = self.kv.get(&format!("{MSG_RESUME}:{chat_id}:{msg_id}"))?;
        serde_json::from_value(v).ok()
    }

    pub fn session_for_reply(&self, chat_id: &str, msg_id: &str) -> Option<String> {
        self.kv
            .get(&format!("{MSG_SESSION}:{chat_id}:{msg_id}"))
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    // ── Selected resume ──────────────────────────────────────────────

    pub fn set_selected_resume(&self, chat_id: &str, token: &ResumeToken) {
        if let Ok(v) = serde_json::to_value(token) {
            self.kv.put(&format!("{SELECTED_RESUME}:{chat_id}"), v);
        }
    }

    pub fn selected_resume(&self, chat_id: &str) -> Option<ResumeToken> {
        let v = self.kv.get(&format!("{SELECTED_RESUME}:{chat_id}"))?;
        serde_json::from_value(v).ok()
    }

    // ── Chat state ───────────────────────────────────────────────────

    pub fn set_chat_state(&self, chat_id: &str, state: serde_json::Value) {
        self.kv.put(&format!("{CHAT_STATE}:{chat_id}"), state);
    }

    pub fn chat_state(&self, chat_id: &str) -> Option<serde_json::Value> {
        self.kv.get(&format!("{CHAT_STATE}:{chat_id}"))
    }

    /// Drop chat state, selected resume, and every message index for the
    /// chat.  Called on context overflow.
    pub fn clear_resume_state(&self, chat_id: &str) {
        self.kv.delete(&format!("{CHAT_STATE}:{chat_id}"));
        self.kv.delete(&format!("{SELECTED_RESUME}:{chat_id}"));
        for prefix in [MSG_RESUME, MSG_SESSION] {
            for key in self.kv.keys_with_prefix(&format!("{prefix}:{chat_id}:")) {
                self.kv.delete(&key);
            }
        }
    }

    // ── Pending compaction ───────────────────────────────────────────

    pub fn mark_pending_compaction(&self, chat_id: &str, mark: PendingCompaction) {
        match serde_json::to_value(&mark) {
            Ok(v) => self.kv.put(&format!("{PENDING_COMPACTION}:{chat_id}"), v),
            Err(e) => tracing::warn!(error = %e, "failed to encode compaction mark"),
        }
    }

    pub fn pending_compaction(&self, chat_id: &str) -> Option<PendingCompaction> {
        let v = self.kv.get(&format!("{PENDING_COMPACTION}:{chat_id}"))?;
        serde_json::from_value(v).ok()
    }

    pub fn clear_pending_compaction(&self, chat_id: &str) {
        self.kv.delete(&format!("{PENDING_COMPACTION}:{chat_id}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemon_sessions::MemoryKv;

    fn state() -> TelegramState {
        TelegramState::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn resume_index_round_trip() {
        let st = state();
        let token = ResumeToken::new("codex", "t1");
        st.index_resume("42", "m7", &token, "agent:a:telegram:default:dm:42");
        assert_eq!(st.resume_for_reply("42", "m7"), Some(token));
        assert_eq!(
            st.session_for_reply("42", "m7").as_deref(),
            Some("agent:a:telegram:default:dm:42")
        );
        assert!(st.resume_for_reply("42", "m8").is_none());
        assert!(st.resume_for_reply("43", "m7").is_none());
    }

    #[test]
    fn selected_resume_round_trip() {
        let st = state();
        assert!(st.selected_resume("42").is_none());
        st.set_selected_resume("42", &ResumeToken::new("claude", "x"));
        assert_eq!(st.selected_resume("42").unwrap().engine, "claude");
    }

    #[test]
    fn clear_resume_state_drops_everything_for_chat_only() {
        let st = state();
        let token = ResumeToken::new("codex", "t1");
        st.index_resume("42", "m1", &token, "sk");
        st.index_resume("42", "m2", &token, "sk");
        st.index_resume("99", "m1", &token, "sk2");
        st.set_selected_resume("42", &token);
        st.set_chat_state("42", serde_json::json!({"mode": "chatty"}));

        st.clear_resume_state("42");

        assert!(st.resume_for_reply("42", "m1").is_none());
        assert!(st.resume_for_reply("42", "m2").is_none());
        assert!(st.selected_resume("42").is_none());
        assert!(st.chat_state("42").is_none());
        // Other chats untouched.
        assert!(st.resume_for_reply("99", "m1").is_some());
    }

    #[test]
    fn pending_compaction_round_trip() {
        let st = state();
        st.mark_pending_compaction(
            "42",
            PendingCompaction {
                reason: CompactionReason::NearLimit,
                input_tokens: Some(390_000),
                threshold_tokens: Some(340_000),
                context_window_tokens: Some(400_000),
            },
        );
        let mark = st.pending_compaction("42").unwrap();
        assert_eq!(mark.reason, CompactionReason::NearLimit);
        assert_eq!(mark.input_tokens, Some(390_000));
        st.clear_pending_compaction("42");
        assert!(st.pending_compaction("42").is_none());
    }
}
