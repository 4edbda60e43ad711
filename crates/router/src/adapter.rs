//! Channel adapters — per-channel emission behaviour behind one trait.
//!
//! The coalescers own buffering and timing; the adapter owns what actually
//! goes out: chunk sends vs. edits, the Telegram dual-message model,
//! truncation, status decorations, and resume indexing.  Adapters are
//! resolved through [`ChannelAdapterRegistry`] by capability probe, never
//! by hard-coded name checks in the core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use lemon_domain::event::ActionRecord;
use lemon_domain::outbound::{
    DeliveryAck, OutboundContent, OutboundPayload, PayloadMeta, ReplyMarkup, SendFile,
};
use lemon_domain::{tail_str, JobMeta, Peer, ResumeToken};

use lemon_domain::config::TelegramConfig;

use crate::outbox::{enqueue_best_effort, ChannelOutbox, DeliveryNotify};
use crate::telegram_state::TelegramState;

/// Telegram message size limit.
const TELEGRAM_TEXT_LIMIT: usize = 4096;
/// Telegram status window: show only the newest actions.
const TELEGRAM_ACTION_WINDOW: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared coalescer state views
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The transport-addressing metadata a coalescer carries for its channel.
/// Merging is compacting: absent incoming fields never wipe known ones, so
/// transport message ids learned earlier survive meta refreshes.
#[derive(Debug, Clone, Default)]
pub struct CoalescerMeta {
    pub account_id: Option<String>,
    pub peer: Option<Peer>,
    pub progress_msg_id: Option<String>,
    pub status_msg_id: Option<String>,
    pub user_msg_id: Option<String>,
}

impl CoalescerMeta {
    pub fn from_job(meta: &JobMeta) -> Self {
        Self {
            account_id: meta.account_id.clone(),
            peer: meta.peer.clone(),
            progress_msg_id: meta.progress_msg_id.clone(),
            status_msg_id: meta.status_msg_id.clone(),
            user_msg_id: meta.user_msg_id.clone(),
        }
    }

    /// Merge, dropping incoming nils.
    pub fn merge_compact(&mut self, incoming: &CoalescerMeta) {
        macro_rules! keep {
            ($($field:ident),*) => {
                $(if incoming.$field.is_some() {
                    self.$field = incoming.$field.clone();
                })*
            };
        }
        keep!(account_id, peer, progress_msg_id, status_msg_id, user_msg_id);
    }
}

/// Per-run answer-message bookkeeping for the stream coalescer.
#[derive(Debug, Default)]
pub struct AnswerState {
    pub answer_msg_id: Option<String>,
    pub answer_create_ref: Option<Uuid>,
    pub deferred_answer_text: Option<String>,
    pub last_sent_text: Option<String>,
}

/// Per-run status-message bookkeeping for the tool-status coalescer.
#[derive(Debug, Default)]
pub struct StatusState {
    pub status_msg_id: Option<String>,
    pub status_create_ref: Option<Uuid>,
    pub deferred_text: Option<String>,
    pub last_text: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emission contexts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a payload goes and on whose behalf.
pub struct EmitTarget<'a> {
    pub outbox: &'a dyn ChannelOutbox,
    pub channel_id: &'a str,
    pub account_id: &'a str,
    pub peer: &'a Peer,
    pub run_id: &'a str,
    pub session_key: &'a str,
}

impl EmitTarget<'_> {
    pub fn payload(
        &self,
        content: OutboundContent,
        reply_to: Option<String>,
        idempotency_key: String,
        seq: Option<u64>,
        is_final: bool,
        reply_markup: Option<ReplyMarkup>,
    ) -> OutboundPayload {
        OutboundPayload {
            channel_id: self.channel_id.to_owned(),
            account_id: self.account_id.to_owned(),
            peer: self.peer.clone(),
            content,
            reply_to,
            idempotency_key,
            meta: PayloadMeta {
                run_id: self.run_id.to_owned(),
                session_key: self.session_key.to_owned(),
                is_final,
                seq,
                reply_markup,
                auto_send_generated: false,
            },
        }
    }
}

pub struct StreamEmitCtx<'a> {
    pub target: EmitTarget<'a>,
    pub seq: u64,
    /// The buffered chunk being flushed (append model).
    pub chunk: &'a str,
    /// The accumulated text (edit/convergence model).
    pub full_text: &'a str,
    pub meta: &'a mut CoalescerMeta,
    pub state: &'a mut AnswerState,
    pub ack_tx: &'a mpsc::UnboundedSender<DeliveryAck>,
}

pub struct StreamFinalCtx<'a> {
    pub target: EmitTarget<'a>,
    pub ok: bool,
    pub error: Option<String>,
    pub final_text: Option<&'a str>,
    pub full_text: &'a str,
    pub buffer: &'a str,
    pub resume: Option<&'a ResumeToken>,
    pub meta: &'a mut CoalescerMeta,
    pub state: &'a mut AnswerState,
    pub ack_tx: &'a mpsc::UnboundedSender<DeliveryAck>,
}

pub struct StatusEmitCtx<'a> {
    pub target: EmitTarget<'a>,
    pub seq: u64,
    /// Rendered status text (already order-limited and decorated).
    pub text: &'a str,
    pub finalized: bool,
    pub meta: &'a mut CoalescerMeta,
    pub state: &'a mut StatusState,
    pub ack_tx: &'a mpsc::UnboundedSender<DeliveryAck>,
}

/// Context for a delivery ack landing on either coalescer.
pub struct AckCtx<'a> {
    pub target: EmitTarget<'a>,
    pub ack: DeliveryAck,
    pub create_ref: &'a mut Option<Uuid>,
    pub msg_id_slot: &'a mut Option<String>,
    pub deferred_text: &'a mut Option<String>,
    pub last_text: &'a mut Option<String>,
    /// Idempotency phase for the deferred edit: `answer` or `status`.
    pub phase: &'a str,
    pub seq: u64,
    /// Markup to carry on the deferred edit (status keeps its cancel
    /// button until finalize).
    pub reply_markup: Option<ReplyMarkup>,
}

/// Shared ack behaviour: resolve the in-flight create, record the message
/// id, and edit any deferred text in.
pub async fn default_handle_ack(cx: AckCtx<'_>) {
    if *cx.create_ref != Some(cx.ack.notify_ref) {
        return;
    }
    *cx.create_ref = None;
    if !cx.ack.ok {
        return;
    }
    let Some(message_id) = cx.ack.message_id.clone() else {
        return;
    };
    *cx.msg_id_slot = Some(message_id.clone());
    if let Some(text) = cx.deferred_text.take() {
        if cx.last_text.as_deref() != Some(text.as_str()) {
            let payload = cx.target.payload(
                OutboundContent::Edit {
                    message_id,
                    text: text.clone(),
                },
                None,
                format!("{}:{}:deferred:{}", cx.target.run_id, cx.phase, cx.seq),
                Some(cx.seq),
                false,
                cx.reply_markup,
            );
            enqueue_best_effort(cx.target.outbox, payload).await;
            *cx.last_text = Some(text);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct AutoSendConfig {
    pub enabled: bool,
    /// Forward generated images picked up from file-change actions.
    pub send_generated_images: bool,
}

impl Default for AutoSendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_generated_images: true,
        }
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_id(&self) -> &str;

    fn supports_edit(&self) -> bool {
        false
    }

    /// Whether this channel keeps per-chat resume/compaction state.
    fn supports_resume_index(&self) -> bool {
        false
    }

    fn truncate(&self, text: &str) -> String {
        text.to_string()
    }

    /// Limit the rendered action order; returns `(omitted, window)`.
    fn limit_order(&self, order: &[String]) -> (usize, Vec<String>) {
        (0, order.to_vec())
    }

    /// Per-action decoration appended after the title.
    fn format_action_extra(&self, _action: &ActionRecord) -> String {
        String::new()
    }

    fn tool_status_reply_markup(&self, run_id: &str, finalized: bool) -> Option<ReplyMarkup> {
        if finalized {
            Some(ReplyMarkup::cleared())
        } else {
            Some(ReplyMarkup::cancel_button(run_id))
        }
    }

    fn auto_send_config(&self) -> AutoSendConfig {
        AutoSendConfig::default()
    }

    fn files_max_download_bytes(&self) -> u64 {
        10 * 1024 * 1024
    }

    /// When true, a completion without deltas does not synthesize a final
    /// answer delta (the adapter's finalize path handles the answer).
    fn skip_non_streaming_final_emit(&self) -> bool {
        false
    }

    fn should_finalize_stream(&self) -> bool {
        true
    }

    fn batch_files(&self, files: Vec<SendFile>) -> Vec<Vec<SendFile>> {
        if files.is_empty() {
            Vec::new()
        } else {
            vec![files]
        }
    }

    async fn emit_stream_output(&self, cx: &mut StreamEmitCtx<'_>);

    async fn finalize_stream(&self, cx: &mut StreamFinalCtx<'_>);

    async fn emit_tool_status(&self, cx: &mut StatusEmitCtx<'_>);

    async fn handle_delivery_ack(&self, cx: AckCtx<'_>) {
        default_handle_ack(cx).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generic adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default behaviour for channels without the dual-message model: chunk
/// sends on plain channels, progress-message edits on edit-capable ones.
pub struct GenericAdapter {
    channel_id: String,
    edit_capable: bool,
}

impl GenericAdapter {
    pub fn new(channel_id: impl Into<String>, edit_capable: bool) -> Self {
        Self {
            channel_id: channel_id.into(),
            edit_capable,
        }
    }
}

#[async_trait]
impl ChannelAdapter for GenericAdapter {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn supports_edit(&self) -> bool {
        self.edit_capable
    }

    async fn emit_stream_output(&self, cx: &mut StreamEmitCtx<'_>) {
        if self.edit_capable {
            if let Some(progress_id) = cx.meta.progress_msg_id.clone() {
                let text = self.truncate(cx.full_text);
                if text.is_empty() || cx.state.last_sent_text.as_deref() == Some(text.as_str()) {
                    return;
                }
                let payload = cx.target.payload(
                    OutboundContent::Edit {
                        message_id: progress_id,
                        text: text.clone(),
                    },
                    None,
                    format!("{}:answer:{}", cx.target.run_id, cx.seq),
                    Some(cx.seq),
                    false,
                    None,
                );
                enqueue_best_effort(cx.target.outbox, payload).await;
                cx.state.last_sent_text = Some(text);
                return;
            }
        }
        if cx.chunk.is_empty() {
            return;
        }
        let payload = cx.target.payload(
            OutboundContent::Text {
                text: cx.chunk.to_owned(),
            },
            None,
            format!("{}:answer:{}", cx.target.run_id, cx.seq),
            Some(cx.seq),
            false,
            None,
        );
        enqueue_best_effort(cx.target.outbox, payload).await;
    }

    async fn finalize_stream(&self, cx: &mut StreamFinalCtx<'_>) {
        if self.edit_capable {
            if let Some(progress_id) = cx.meta.progress_msg_id.clone() {
                let text = effective_text(cx.final_text, cx.full_text, cx.buffer)
                    .map(|t| self.truncate(t));
                let Some(text) = text else { return };
                if cx.state.last_sent_text.as_deref() == Some(text.as_str()) {
                    return;
                }
                let payload = cx.target.payload(
                    OutboundContent::Edit {
                        message_id: progress_id,
                        text: text.clone(),
                    },
                    None,
                    format!("{}:final:send", cx.target.run_id),
                    None,
                    true,
                    None,
                );
                enqueue_best_effort(cx.target.outbox, payload).await;
                cx.state.last_sent_text = Some(text);
                return;
            }
        }
        // Plain channels: flush whatever is still buffered.
        if cx.buffer.is_empty() {
            return;
        }
        let payload = cx.target.payload(
            OutboundContent::Text {
                text: cx.buffer.to_owned(),
            },
            None,
            format!("{}:final:send", cx.target.run_id),
            None,
            true,
            None,
        );
        enqueue_best_effort(cx.target.outbox, payload).await;
    }

    async fn emit_tool_status(&self, cx: &mut StatusEmitCtx<'_>) {
        emit_status_common(self, cx).await;
    }
}

/// First non-empty of final answer, accumulated text, pending buffer.
fn effective_text<'a>(
    final_text: Option<&'a str>,
    full_text: &'a str,
    buffer: &'a str,
) -> Option<&'a str> {
    [final_text.unwrap_or(""), full_text, buffer]
        .into_iter()
        .find(|t| !t.trim().is_empty())
}

/// Status emission shared by every adapter: edit when the status message
/// exists, create-with-markup when it doesn't, defer while a create is in
/// flight.
async fn emit_status_common(adapter: &dyn ChannelAdapter, cx: &mut StatusEmitCtx<'_>) {
    let markup = adapter.tool_status_reply_markup(cx.target.run_id, cx.finalized);
    if let Some(status_id) = cx
        .state
        .status_msg_id
        .clone()
        .or_else(|| cx.meta.status_msg_id.clone())
    {
        let payload = cx.target.payload(
            OutboundContent::Edit {
                message_id: status_id,
                text: cx.text.to_owned(),
            },
            None,
            format!("{}:status:{}", cx.target.run_id, cx.seq),
            Some(cx.seq),
            cx.finalized,
            markup,
        );
        enqueue_best_effort(cx.target.outbox, payload).await;
        cx.state.last_text = Some(cx.text.to_owned());
    } else if cx.state.status_create_ref.is_some() {
        cx.state.deferred_text = Some(cx.text.to_owned());
    } else {
        let notify = DeliveryNotify::new(cx.ack_tx.clone());
        cx.state.status_create_ref = Some(notify.notify_ref);
        let payload = cx.target.payload(
            OutboundContent::Text {
                text: cx.text.to_owned(),
            },
            cx.meta.user_msg_id.clone(),
            format!("{}:status:{}", cx.target.run_id, cx.seq),
            Some(cx.seq),
            cx.finalized,
            markup,
        );
        let key = payload.idempotency_key.clone();
        match cx.target.outbox.enqueue_with_notify(payload, notify).await {
            Ok(()) | Err(lemon_domain::Error::Duplicate) => {}
            Err(e) => {
                cx.state.status_create_ref = None;
                tracing::warn!(error = %e, idempotency_key = %key, "status send dropped");
            }
        }
        cx.state.last_text = Some(cx.text.to_owned());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Telegram adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingResume {
    chat_id: String,
    token: ResumeToken,
    session_key: String,
}

/// Telegram carries the dual-message model: a progress message holding the
/// cancel button and tool status, and a separate answer message the
/// coalescer converges onto.  Finalize appends the resume footer and
/// indexes the answer message for reply-to-resume.
pub struct TelegramAdapter {
    state: Arc<TelegramState>,
    cfg: TelegramConfig,
    pending_resume: Arc<Mutex<HashMap<Uuid, PendingResume>>>,
    resume_ack_tx: mpsc::UnboundedSender<DeliveryAck>,
}

impl TelegramAdapter {
    /// Needs a tokio runtime: spawns the resume-index ack listener, which
    /// outlives any single coalescer.
    pub fn new(state: Arc<TelegramState>, cfg: TelegramConfig) -> Self {
        let pending_resume: Arc<Mutex<HashMap<Uuid, PendingResume>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (resume_ack_tx, mut rx) = mpsc::unbounded_channel::<DeliveryAck>();
        {
            let pending = pending_resume.clone();
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(ack) = rx.recv().await {
                    let entry = pending.lock().remove(&ack.notify_ref);
                    if let Some(entry) = entry {
                        if let (true, Some(msg_id)) = (ack.ok, ack.message_id.as_ref()) {
                            state.index_resume(
                                &entry.chat_id,
                                msg_id,
                                &entry.token,
                                &entry.session_key,
                            );
                        }
                    }
                }
            });
        }
        Self {
            state,
            cfg,
            pending_resume,
            resume_ack_tx,
        }
    }

    pub fn telegram_state(&self) -> &Arc<TelegramState> {
        &self.state
    }

    /// Park a resume-index entry until its delivery ack arrives, with a
    /// capped-backoff cleanup that drops the entry if the ack never comes.
    fn register_pending_resume(&self, notify_ref: Uuid, entry: PendingResume) {
        self.pending_resume.lock().insert(notify_ref, entry);
        let pending = self.pending_resume.clone();
        let attempts = self.cfg.resume_retry_attempts;
        let base = self.cfg.resume_retry_base_ms;
        let cap = self.cfg.resume_retry_cap_ms;
        tokio::spawn(async move {
            for attempt in 0..attempts {
                let delay = base.saturating_mul(1u64 << attempt).min(cap);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if !pending.lock().contains_key(&notify_ref) {
                    return;
                }
            }
            if pending.lock().remove(&notify_ref).is_some() {
                tracing::warn!(
                    notify_ref = %notify_ref,
                    "resume-index ack never arrived; dropping stale entry"
                );
            }
        });
    }

    #[cfg(test)]
    fn pending_resume_len(&self) -> usize {
        self.pending_resume.lock().len()
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        "telegram"
    }

    fn supports_edit(&self) -> bool {
        true
    }

    fn supports_resume_index(&self) -> bool {
        true
    }

    /// Telegram caps messages at 4096 chars.  During streaming the tail is
    /// the fresh content, so the head is elided.
    fn truncate(&self, text: &str) -> String {
        if text.len() <= TELEGRAM_TEXT_LIMIT {
            return text.to_string();
        }
        let tail = tail_str(text, TELEGRAM_TEXT_LIMIT - '\u{2026}'.len_utf8());
        format!("\u{2026}{tail}")
    }

    fn limit_order(&self, order: &[String]) -> (usize, Vec<String>) {
        if order.len() <= TELEGRAM_ACTION_WINDOW {
            (0, order.to_vec())
        } else {
            let omitted = order.len() - TELEGRAM_ACTION_WINDOW;
            (omitted, order[omitted..].to_vec())
        }
    }

    fn format_action_extra(&self, action: &ActionRecord) -> String {
        crate::coalescer::render::telegram_action_extra(action)
    }

    fn skip_non_streaming_final_emit(&self) -> bool {
        true
    }

    async fn emit_stream_output(&self, cx: &mut StreamEmitCtx<'_>) {
        let text = self.truncate(cx.full_text);
        if text.is_empty() {
            return;
        }
        if let Some(answer_id) = cx.state.answer_msg_id.clone() {
            if cx.state.last_sent_text.as_deref() == Some(text.as_str()) {
                return;
            }
            let payload = cx.target.payload(
                OutboundContent::Edit {
                    message_id: answer_id,
                    text: text.clone(),
                },
                None,
                format!("{}:answer:{}", cx.target.run_id, cx.seq),
                Some(cx.seq),
                false,
                None,
            );
            enqueue_best_effort(cx.target.outbox, payload).await;
            cx.state.last_sent_text = Some(text);
        } else if cx.state.answer_create_ref.is_some() {
            // A create is in flight; the ack handler edits this in.
            cx.state.deferred_answer_text = Some(text);
        } else {
            let notify = DeliveryNotify::new(cx.ack_tx.clone());
            cx.state.answer_create_ref = Some(notify.notify_ref);
            let payload = cx.target.payload(
                OutboundContent::Text { text: text.clone() },
                cx.meta.user_msg_id.clone(),
                format!("{}:answer:{}", cx.target.run_id, cx.seq),
                Some(cx.seq),
                false,
                None,
            );
            let key = payload.idempotency_key.clone();
            match cx.target.outbox.enqueue_with_notify(payload, notify).await {
                Ok(()) | Err(lemon_domain::Error::Duplicate) => {
                    cx.state.last_sent_text = Some(text);
                }
                Err(e) => {
                    cx.state.answer_create_ref = None;
                    tracing::warn!(error = %e, idempotency_key = %key, "answer send dropped");
                }
            }
        }
    }

    async fn finalize_stream(&self, cx: &mut StreamFinalCtx<'_>) {
        let mut text = match effective_text(cx.final_text, cx.full_text, cx.buffer) {
            Some(t) => t.to_string(),
            None if cx.ok => "Done".to_string(),
            None => format!(
                "Run failed: {}",
                cx.error.as_deref().unwrap_or("unknown error")
            ),
        };
        if self.cfg.resume_footer {
            if let Some(token) = cx.resume {
                let footer = token.footer_line();
                if !text.contains(&footer) {
                    text = format!("{text}\n\n{footer}");
                }
            }
        }
        let text = self.truncate(&text);
        let chat_id = cx.target.peer.id.clone();

        if let Some(answer_id) = cx.state.answer_msg_id.clone() {
            if cx.state.last_sent_text.as_deref() != Some(text.as_str()) {
                let payload = cx.target.payload(
                    OutboundContent::Edit {
                        message_id: answer_id.clone(),
                        text: text.clone(),
                    },
                    None,
                    format!("{}:final:send", cx.target.run_id),
                    None,
                    true,
                    None,
                );
                enqueue_best_effort(cx.target.outbox, payload).await;
                cx.state.last_sent_text = Some(text);
            }
            if let Some(token) = cx.resume {
                self.state
                    .index_resume(&chat_id, &answer_id, token, cx.target.session_key);
            }
        } else if let Some(create_ref) = cx.state.answer_create_ref {
            // The answer message is still being created; the create-ack
            // will edit the final text in and index the resume token.
            cx.state.deferred_answer_text = Some(text);
            if let Some(token) = cx.resume {
                self.register_pending_resume(
                    create_ref,
                    PendingResume {
                        chat_id,
                        token: token.clone(),
                        session_key: cx.target.session_key.to_owned(),
                    },
                );
            }
        } else {
            let notify = DeliveryNotify::new(self.resume_ack_tx.clone());
            if let Some(token) = cx.resume {
                self.register_pending_resume(
                    notify.notify_ref,
                    PendingResume {
                        chat_id,
                        token: token.clone(),
                        session_key: cx.target.session_key.to_owned(),
                    },
                );
            }
            let payload = cx.target.payload(
                OutboundContent::Text { text: text.clone() },
                cx.meta.user_msg_id.clone(),
                format!("{}:final:send", cx.target.run_id),
                None,
                true,
                None,
            );
            let key = payload.idempotency_key.clone();
            match cx.target.outbox.enqueue_with_notify(payload, notify).await {
                Ok(()) | Err(lemon_domain::Error::Duplicate) => {
                    cx.state.last_sent_text = Some(text);
                }
                Err(e) => {
                    tracing::warn!(error = %e, idempotency_key = %key, "final send dropped");
                }
            }
        }
    }

    async fn emit_tool_status(&self, cx: &mut StatusEmitCtx<'_>) {
        emit_status_common(self, cx).await;
    }

    async fn handle_delivery_ack(&self, cx: AckCtx<'_>) {
        let ack = cx.ack.clone();
        default_handle_ack(cx).await;
        // A finalize may have parked a resume entry on this create ref.
        let entry = self.pending_resume.lock().remove(&ack.notify_ref);
        if let Some(entry) = entry {
            if let (true, Some(msg_id)) = (ack.ok, ack.message_id.as_ref()) {
                self.state
                    .index_resume(&entry.chat_id, msg_id, &entry.token, &entry.session_key);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capability probe: resolve the adapter for a channel, falling back to a
/// plain non-edit adapter for channels nobody registered.
pub struct ChannelAdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl Default for ChannelAdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelAdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters
            .write()
            .insert(adapter.channel_id().to_owned(), adapter);
    }

    pub fn get(&self, channel_id: &str) -> Arc<dyn ChannelAdapter> {
        if let Some(adapter) = self.adapters.read().get(channel_id) {
            return adapter.clone();
        }
        Arc::new(GenericAdapter::new(channel_id, false))
    }
}
