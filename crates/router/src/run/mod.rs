//! The run process — a per-run actor owning the lifecycle of one prompt.
//!
//! It submits the job to the engine gateway (with retry while the gateway
//! is unavailable), consumes the run-topic event stream, fans events out
//! to the session topic and both coalescers, synthesizes a completion if
//! the gateway run dies silently, and releases the session slot the
//! moment the run completes.

pub mod compaction;
pub mod supervisor;

use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use lemon_domain::event::{error_text, ActionKind, ActionRecord, BusEvent, GatewayEvent, Usage};
use lemon_domain::outbound::{OutboundContent, SendFile};
use lemon_domain::{Job, ResumeToken, Result, RouterConfig};
use lemon_sessions::SessionRegistry;

use crate::adapter::{ChannelAdapter, ChannelAdapterRegistry, CoalescerMeta, EmitTarget};
use crate::bus::{run_topic, session_topic, EventBus, Subscription};
use crate::coalescer::{StatusCoalescers, StreamCoalescers};
use crate::gateway::{DownReason, EngineGateway, EngineRegistry, GatewayError};
use crate::outbox::{enqueue_best_effort, ChannelOutbox};
use crate::telegram_state::{CompactionReason, PendingCompaction, TelegramState};

use compaction::{compaction_threshold, is_context_overflow};
use supervisor::{RunRegistry, RunSupervisor};

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// File extensions treated as generated images worth forwarding.
const IMAGE_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "tif", "tiff", "heic", "heif",
];

/// Control messages castable to a run process.
#[derive(Debug)]
pub enum RunMsg {
    Abort,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dependencies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a run process (and the orchestrator above it) needs.
#[derive(Clone)]
pub struct RunDeps {
    pub bus: EventBus,
    pub gateway: std::sync::Arc<dyn EngineGateway>,
    pub engines: std::sync::Arc<EngineRegistry>,
    pub adapters: std::sync::Arc<ChannelAdapterRegistry>,
    pub outbox: std::sync::Arc<dyn ChannelOutbox>,
    pub sessions: std::sync::Arc<SessionRegistry>,
    pub runs: std::sync::Arc<RunRegistry>,
    pub supervisor: std::sync::Arc<RunSupervisor>,
    pub streams: std::sync::Arc<StreamCoalescers>,
    pub statuses: std::sync::Arc<StatusCoalescers>,
    pub telegram: std::sync::Arc<TelegramState>,
    pub config: std::sync::Arc<RouterConfig>,
}

/// Spawn a run process under the bounded supervisor.
pub fn spawn_run(deps: &RunDeps, job: Job) -> Result<()> {
    let run_id = job.run_id.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    deps.runs.register(&run_id, tx);
    let process = RunProcess::new(deps.clone(), job, rx);
    if let Err(e) = deps.supervisor.try_spawn(process.run()) {
        deps.runs.remove(&run_id);
        return Err(e);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RunState {
    aborted: bool,
    completed: bool,
    saw_delta: bool,
    session_registered: bool,
    pending_run_started: Option<GatewayEvent>,
    gateway_submitted: bool,
    submit_attempt: u32,
    gateway_run_ref: Option<uuid::Uuid>,
    generated_image_paths: Vec<String>,
    requested_send_files: Vec<SendFile>,
}

struct RunProcess {
    deps: RunDeps,
    job: Job,
    sub: Subscription,
    inbox: mpsc::UnboundedReceiver<RunMsg>,
    down_rx: Option<oneshot::Receiver<DownReason>>,
    state: RunState,

    submit_at: Option<Instant>,
    register_retry_at: Option<Instant>,
    register_delay_ms: u64,
    down_grace_at: Option<Instant>,
    down_reason: Option<DownReason>,
}

impl RunProcess {
    fn new(deps: RunDeps, job: Job, inbox: mpsc::UnboundedReceiver<RunMsg>) -> Self {
        let sub = deps.bus.subscribe(&run_topic(&job.run_id));
        let register_delay_ms = deps.config.runs.register_retry_ms;
        Self {
            deps,
            job,
            sub,
            inbox,
            down_rx: None,
            state: RunState::default(),
            submit_at: Some(Instant::now()),
            register_retry_at: None,
            register_delay_ms,
            down_grace_at: None,
            down_reason: None,
        }
    }

    async fn run(mut self) {
        tracing::debug!(
            run_id = %self.job.run_id,
            session_key = %self.job.session_key,
            "run process started"
        );
        self.run_loop().await;
        self.terminate().await;
    }

    async fn run_loop(&mut self) {
        loop {
            if self.state.completed {
                return;
            }
            let submit_at = self.submit_at.unwrap_or_else(far_future);
            let register_at = self.register_retry_at.unwrap_or_else(far_future);
            let grace_at = self.down_grace_at.unwrap_or_else(far_future);

            tokio::select! {
                ev = self.sub.rx.recv() => {
                    let Some(ev) = ev else { return };
                    self.handle_bus_event(ev).await;
                }
                msg = self.inbox.recv() => {
                    if let Some(RunMsg::Abort) = msg {
                        self.handle_abort();
                    }
                }
                reason = async { self.down_rx.as_mut().expect("guarded").await },
                    if self.down_rx.is_some() =>
                {
                    self.down_rx = None;
                    let reason = reason.unwrap_or_else(|_| DownReason::Crash("link lost".into()));
                    self.handle_gateway_down(reason);
                }
                _ = tokio::time::sleep_until(submit_at), if self.submit_at.is_some() => {
                    self.submit_at = None;
                    self.try_submit().await;
                }
                _ = tokio::time::sleep_until(register_at), if self.register_retry_at.is_some() => {
                    self.register_retry_at = None;
                    self.retry_register();
                }
                _ = tokio::time::sleep_until(grace_at), if self.down_grace_at.is_some() => {
                    self.down_grace_at = None;
                    self.fire_down_grace();
                }
            }
        }
    }

    // ── Gateway submit ───────────────────────────────────────────────

    async fn try_submit(&mut self) {
        if self.state.gateway_submitted || self.state.aborted || self.state.completed {
            return;
        }
        self.state.submit_attempt += 1;
        match self.deps.gateway.submit(&self.job).await {
            Ok(run) => {
                self.state.gateway_submitted = true;
                self.state.gateway_run_ref = Some(run.run_ref);
                self.down_rx = Some(run.down);
                tracing::debug!(
                    run_id = %self.job.run_id,
                    gateway_run_ref = %run.run_ref,
                    attempt = self.state.submit_attempt,
                    "job submitted to gateway"
                );
            }
            Err(GatewayError::Unavailable) => {
                let cfg = &self.deps.config.runs;
                if self.state.submit_attempt >= cfg.submit_max_attempts {
                    tracing::warn!(
                        run_id = %self.job.run_id,
                        attempts = self.state.submit_attempt,
                        "gateway never became available"
                    );
                    self.synthesize_completion("gateway_unavailable");
                } else {
                    let shift = (self.state.submit_attempt - 1).min(31);
                    let backoff = cfg
                        .submit_backoff_ms
                        .saturating_mul(1u64 << shift)
                        .min(cfg.submit_backoff_cap_ms);
                    self.submit_at = Some(Instant::now() + Duration::from_millis(backoff));
                }
            }
            Err(GatewayError::Rejected(reason)) => {
                tracing::warn!(run_id = %self.job.run_id, reason = %reason, "gateway rejected job");
                self.synthesize_completion(&format!("rejected: {reason}"));
            }
        }
    }

    /// Publish a synthetic completion on the run topic so the normal
    /// completion path drives teardown.
    fn synthesize_completion(&self, reason: &str) {
        self.deps.bus.publish(
            &run_topic(&self.job.run_id),
            BusEvent::Gateway(GatewayEvent::RunCompleted {
                run_id: self.job.run_id.clone(),
                ok: false,
                answer: Some(String::new()),
                resume: None,
                usage: None,
                error: Some(json!({ "gateway_run_down": reason })),
            }),
        );
    }

    // ── Gateway DOWN ─────────────────────────────────────────────────

    fn handle_gateway_down(&mut self, reason: DownReason) {
        if self.state.completed {
            return;
        }
        let cfg = &self.deps.config.runs;
        let grace = if reason.is_clean() {
            cfg.down_grace_ms
        } else {
            cfg.down_grace_abnormal_ms
        };
        tracing::debug!(
            run_id = %self.job.run_id,
            reason = %reason,
            grace_ms = grace,
            "gateway run exited before completion"
        );
        self.down_reason = Some(reason);
        self.down_grace_at = Some(Instant::now() + Duration::from_millis(grace));
    }

    fn fire_down_grace(&mut self) {
        if self.state.completed {
            return;
        }
        let reason = self
            .down_reason
            .take()
            .unwrap_or(DownReason::Crash("unknown".into()));
        self.synthesize_completion(&reason.to_string());
    }

    // ── Session registration ─────────────────────────────────────────

    fn handle_run_started(&mut self, ev: GatewayEvent) {
        match self
            .deps
            .sessions
            .register(&self.job.session_key, &self.job.run_id)
        {
            Ok(()) => {
                self.state.session_registered = true;
                self.forward_to_session(BusEvent::Gateway(ev));
            }
            Err(holder) => {
                // The slot is busy; the colliding run is not cancelled.
                tracing::debug!(
                    run_id = %self.job.run_id,
                    session_key = %self.job.session_key,
                    holder = %holder.run_id,
                    "session slot taken; stashing run_started"
                );
                self.state.pending_run_started = Some(ev);
                self.register_retry_at =
                    Some(Instant::now() + Duration::from_millis(self.register_delay_ms));
            }
        }
    }

    fn retry_register(&mut self) {
        if self.state.completed || self.state.session_registered {
            return;
        }
        match self
            .deps
            .sessions
            .register(&self.job.session_key, &self.job.run_id)
        {
            Ok(()) => {
                self.state.session_registered = true;
                if let Some(ev) = self.state.pending_run_started.take() {
                    self.forward_to_session(BusEvent::Gateway(ev));
                }
            }
            Err(_) => {
                let cfg = &self.deps.config.runs;
                self.register_delay_ms =
                    (self.register_delay_ms * 2).min(cfg.register_retry_cap_ms);
                self.register_retry_at =
                    Some(Instant::now() + Duration::from_millis(self.register_delay_ms));
            }
        }
    }

    // ── Event handling ───────────────────────────────────────────────

    async fn handle_bus_event(&mut self, ev: BusEvent) {
        match ev {
            BusEvent::Gateway(ev) => {
                if ev.run_id() != self.job.run_id {
                    return;
                }
                self.handle_gateway_event(ev).await;
            }
            other => self.forward_to_session(other),
        }
    }

    async fn handle_gateway_event(&mut self, ev: GatewayEvent) {
        match ev {
            GatewayEvent::RunStarted { .. } => self.handle_run_started(ev),
            GatewayEvent::Delta { seq, ref text, .. } => {
                self.forward_to_session(BusEvent::Gateway(ev.clone()));
                if let Some(channel_id) = self.job.meta.channel_id.clone() {
                    if !self.state.saw_delta {
                        // Tool status goes out before the first answer text.
                        self.deps
                            .statuses
                            .flush(&self.job.session_key, &channel_id);
                    }
                    self.deps.streams.ingest_delta(
                        &self.job.session_key,
                        &channel_id,
                        &self.job.run_id,
                        seq,
                        text.clone(),
                        CoalescerMeta::from_job(&self.job.meta),
                    );
                }
                self.state.saw_delta = true;
            }
            GatewayEvent::EngineAction { ref action, .. } => {
                self.forward_to_session(BusEvent::Gateway(ev.clone()));
                self.track_action_artifacts(action);
                if let Some(channel_id) = self.job.meta.channel_id.clone() {
                    self.deps.statuses.ingest_action(
                        &self.job.session_key,
                        &channel_id,
                        &self.job.run_id,
                        action.clone(),
                        CoalescerMeta::from_job(&self.job.meta),
                    );
                }
            }
            GatewayEvent::RunCompleted {
                ok,
                answer,
                resume,
                usage,
                error,
                ..
            } => {
                self.handle_completed(ok, answer, resume, usage, error).await;
            }
            GatewayEvent::RunFailed { .. } => {
                self.forward_to_session(BusEvent::Gateway(ev));
            }
        }
    }

    /// Opportunistic artifact tracking: generated images from file-change
    /// actions, and explicit `auto_send_files` from tool results.
    fn track_action_artifacts(&mut self, action: &ActionRecord) {
        if action.kind == ActionKind::FileChange {
            let deleted = action.detail.change_kind.as_deref() == Some("deleted");
            if let Some(path) = action.detail.path.as_deref() {
                if !deleted && has_image_ext(path) {
                    if !self
                        .state
                        .generated_image_paths
                        .iter()
                        .any(|p| p == path)
                    {
                        self.state.generated_image_paths.push(path.to_owned());
                    }
                }
            }
        }
        for file in &action.detail.auto_send_files {
            if file.path.is_empty() || !std::path::Path::new(&file.path).is_file() {
                continue;
            }
            if self
                .state
                .requested_send_files
                .iter()
                .any(|f| f.path == file.path)
            {
                continue;
            }
            self.state.requested_send_files.push(SendFile {
                path: file.path.clone(),
                filename: file.filename.clone(),
                caption: file.caption.clone(),
            });
        }
    }

    async fn handle_completed(
        &mut self,
        ok: bool,
        answer: Option<String>,
        resume: Option<ResumeToken>,
        usage: Option<Usage>,
        error: Option<serde_json::Value>,
    ) {
        self.state.completed = true;

        // Free the session slot first so the next queued run can start.
        if self.state.session_registered {
            self.deps
                .sessions
                .unregister(&self.job.session_key, &self.job.run_id);
            self.state.session_registered = false;
        }
        // Demonitor: a late DOWN must not race the completion.
        self.down_rx = None;
        self.down_grace_at = None;

        self.forward_to_session(BusEvent::Gateway(GatewayEvent::RunCompleted {
            run_id: self.job.run_id.clone(),
            ok,
            answer: answer.clone(),
            resume: resume.clone(),
            usage,
            error: error.clone(),
        }));

        let error_str = error.as_ref().map(error_text);

        if let Some(channel_id) = self.job.meta.channel_id.clone() {
            let adapter = self.deps.adapters.get(&channel_id);
            let meta = CoalescerMeta::from_job(&self.job.meta);

            self.deps.statuses.finalize_run(
                &self.job.session_key,
                &channel_id,
                &self.job.run_id,
                ok,
                meta.clone(),
            );
            if !self.state.saw_delta {
                self.deps
                    .statuses
                    .flush(&self.job.session_key, &channel_id);
            }

            // Completion without deltas synthesizes the answer as one
            // delta on channels whose finalize does not carry it.
            if !self.state.saw_delta && !adapter.skip_non_streaming_final_emit() {
                if let Some(text) = answer.as_deref().filter(|t| !t.trim().is_empty()) {
                    self.deps.streams.ingest_delta(
                        &self.job.session_key,
                        &channel_id,
                        &self.job.run_id,
                        1,
                        text.to_owned(),
                        meta.clone(),
                    );
                }
            }
            if adapter.should_finalize_stream() {
                self.deps.streams.finalize_run(
                    &self.job.session_key,
                    &channel_id,
                    &self.job.run_id,
                    ok,
                    error_str.clone(),
                    answer.clone(),
                    resume.clone(),
                    meta.clone(),
                );
            }

            self.emit_files(adapter.as_ref()).await;
            self.apply_chat_state(adapter.as_ref(), ok, usage, error_str.as_deref());
        }

        tracing::info!(
            run_id = %self.job.run_id,
            session_key = %self.job.session_key,
            ok,
            "run completed"
        );
    }

    /// Telegram-style channels: reset resume state on context overflow,
    /// mark the chat pending compaction near the window limit.
    fn apply_chat_state(
        &self,
        adapter: &dyn ChannelAdapter,
        ok: bool,
        usage: Option<Usage>,
        error_str: Option<&str>,
    ) {
        if !adapter.supports_resume_index() {
            return;
        }
        let Some(chat_id) = self.job.meta.peer.as_ref().map(|p| p.id.clone()) else {
            return;
        };

        if !ok {
            if let Some(err) = error_str {
                if is_context_overflow(err) {
                    tracing::info!(
                        run_id = %self.job.run_id,
                        chat_id = %chat_id,
                        "context overflow; clearing resume state"
                    );
                    self.deps.telegram.clear_resume_state(&chat_id);
                    self.deps.telegram.mark_pending_compaction(
                        &chat_id,
                        PendingCompaction {
                            reason: CompactionReason::Overflow,
                            input_tokens: None,
                            threshold_tokens: None,
                            context_window_tokens: None,
                        },
                    );
                }
            }
            return;
        }

        let Some(usage) = usage else { return };
        let window = self.deps.engines.resolve_context_window(
            &self.deps.config.compaction,
            self.job.meta.model.as_deref(),
            self.job.engine_id.as_deref(),
        );
        let Some(window) = window else { return };
        let threshold = compaction_threshold(window, &self.deps.config.compaction);
        if usage.input_tokens >= threshold {
            self.deps.telegram.mark_pending_compaction(
                &chat_id,
                PendingCompaction {
                    reason: CompactionReason::NearLimit,
                    input_tokens: Some(usage.input_tokens),
                    threshold_tokens: Some(threshold),
                    context_window_tokens: Some(window),
                },
            );
        }
    }

    async fn emit_files(&mut self, adapter: &dyn ChannelAdapter) {
        let cfg = adapter.auto_send_config();
        if !cfg.enabled {
            return;
        }
        let mut files = std::mem::take(&mut self.state.requested_send_files);
        if cfg.send_generated_images {
            for path in std::mem::take(&mut self.state.generated_image_paths) {
                if !files.iter().any(|f| f.path == path) {
                    files.push(SendFile {
                        path,
                        filename: None,
                        caption: None,
                    });
                }
            }
        }
        if files.is_empty() {
            return;
        }
        let (Some(channel_id), Some(peer)) = (
            self.job.meta.channel_id.as_deref(),
            self.job.meta.peer.as_ref(),
        ) else {
            return;
        };
        let account_id = self.job.meta.account_id.as_deref().unwrap_or("default");
        let target = EmitTarget {
            outbox: self.deps.outbox.as_ref(),
            channel_id,
            account_id,
            peer,
            run_id: &self.job.run_id,
            session_key: &self.job.session_key,
        };
        for (i, batch) in adapter.batch_files(files).into_iter().enumerate() {
            let mut payload = target.payload(
                OutboundContent::File { files: batch },
                None,
                format!("{}:files:{i}", self.job.run_id),
                None,
                false,
                None,
            );
            payload.meta.auto_send_generated = true;
            enqueue_best_effort(self.deps.outbox.as_ref(), payload).await;
        }
    }

    // ── Abort & teardown ─────────────────────────────────────────────

    fn handle_abort(&mut self) {
        if self.state.aborted || self.state.completed {
            return;
        }
        self.state.aborted = true;
        tracing::info!(run_id = %self.job.run_id, "abort requested");
        if !self.state.gateway_submitted {
            // Nothing in flight at the gateway; complete the run here.
            self.synthesize_completion("aborted before submit");
            return;
        }
        // The gateway is expected to emit the completion; if it dies
        // instead, the DOWN grace synthesizes one.
        self.deps.gateway.cancel(&self.job.run_id);
    }

    async fn terminate(&mut self) {
        self.deps.runs.remove(&self.job.run_id);
        if self.state.session_registered {
            self.deps
                .sessions
                .unregister(&self.job.session_key, &self.job.run_id);
            self.state.session_registered = false;
        }
        if !self.state.completed {
            // Abnormal end: surface a failure and make a best-effort
            // sweep so the session is not stranded.
            tracing::warn!(
                run_id = %self.job.run_id,
                gateway_run_ref = ?self.state.gateway_run_ref,
                "run process exiting without completion"
            );
            let failed = GatewayEvent::RunFailed {
                run_id: self.job.run_id.clone(),
                reason: "abnormal_exit".to_owned(),
            };
            self.deps
                .bus
                .publish(&run_topic(&self.job.run_id), BusEvent::Gateway(failed.clone()));
            self.forward_to_session(BusEvent::Gateway(failed));
            self.deps.gateway.cancel(&self.job.run_id);
            if let Some(channel_id) = self.job.meta.channel_id.as_deref() {
                self.deps.streams.flush(&self.job.session_key, channel_id);
                self.deps.statuses.flush(&self.job.session_key, channel_id);
            }
        }
    }

    fn forward_to_session(&self, ev: BusEvent) {
        self.deps
            .bus
            .publish(&session_topic(&self.job.session_key), ev);
    }
}

impl Drop for RunProcess {
    fn drop(&mut self) {
        // Covers the capacity-rejected path too, where the task never ran.
        self.deps.bus.unsubscribe(&self.sub.topic, self.sub.id);
    }
}

fn has_image_ext(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTS.contains(&e.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extension_set() {
        for p in [
            "out/chart.png",
            "a.JPG",
            "x.jpeg",
            "x.webp",
            "x.heic",
            "x.tiff",
        ] {
            assert!(has_image_ext(p), "{p}");
        }
        for p in ["notes.txt", "archive.tar.gz", "noext", "x.pngx"] {
            assert!(!has_image_ext(p), "{p}");
        }
    }
}
