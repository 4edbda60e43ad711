//! Tool-status coalescer — per-(session, channel) actor rendering an
//! editable "Tool calls" message from engine-action lifecycle events.
//!
//! `note` actions and actions without an id are filtered before ingestion.
//! Actions upsert in insertion order; beyond `max_actions` the oldest are
//! dropped.  Finalize marks every still-running action completed with the
//! run's ok flag and removes the cancel button.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use lemon_domain::config::CoalescerConfig;
use lemon_domain::event::{ActionKind, ActionPhase, ActionRecord};
use lemon_domain::outbound::{DeliveryAck, OutboundContent, ReplyMarkup};

use crate::adapter::{
    AckCtx, ChannelAdapter, ChannelAdapterRegistry, CoalescerMeta, EmitTarget, StatusEmitCtx,
    StatusState,
};
use crate::coalescer::render::render_status;

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}
use crate::outbox::{enqueue_best_effort, ChannelOutbox};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub enum StatusMsg {
    Action {
        run_id: String,
        action: ActionRecord,
        meta: CoalescerMeta,
    },
    Finalize {
        run_id: String,
        ok: bool,
        meta: CoalescerMeta,
    },
    /// Immediate flush (run process flushes status before the first delta).
    Flush,
}

type Key = (String, String);
type ActorMap = Arc<Mutex<HashMap<Key, mpsc::UnboundedSender<StatusMsg>>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StatusCoalescers {
    actors: ActorMap,
    adapters: Arc<ChannelAdapterRegistry>,
    outbox: Arc<dyn ChannelOutbox>,
    cfg: CoalescerConfig,
}

impl StatusCoalescers {
    pub fn new(
        adapters: Arc<ChannelAdapterRegistry>,
        outbox: Arc<dyn ChannelOutbox>,
        cfg: CoalescerConfig,
    ) -> Self {
        Self {
            actors: Arc::new(Mutex::new(HashMap::new())),
            adapters,
            outbox,
            cfg,
        }
    }

    pub fn ingest_action(
        &self,
        session_key: &str,
        channel_id: &str,
        run_id: &str,
        action: ActionRecord,
        meta: CoalescerMeta,
    ) {
        // High-volume thinking traces and anonymous actions never reach
        // the actor.
        if action.kind == ActionKind::Note || action.id.is_empty() {
            return;
        }
        self.send(
            session_key,
            channel_id,
            StatusMsg::Action {
                run_id: run_id.to_owned(),
                action,
                meta,
            },
            true,
        );
    }

    pub fn finalize_run(
        &self,
        session_key: &str,
        channel_id: &str,
        run_id: &str,
        ok: bool,
        meta: CoalescerMeta,
    ) {
        self.send(
            session_key,
            channel_id,
            StatusMsg::Finalize {
                run_id: run_id.to_owned(),
                ok,
                meta,
            },
            true,
        );
    }

    /// Flush pending status immediately.  Does not spawn a fresh actor.
    pub fn flush(&self, session_key: &str, channel_id: &str) {
        self.send(session_key, channel_id, StatusMsg::Flush, false);
    }

    fn send(&self, session_key: &str, channel_id: &str, msg: StatusMsg, spawn: bool) {
        let key = (session_key.to_owned(), channel_id.to_owned());
        let mut actors = self.actors.lock();
        let msg = match actors.get(&key) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                Err(err) => {
                    actors.remove(&key);
                    err.0
                }
            },
            None => msg,
        };
        if !spawn {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(msg);
        let actor = StatusActor::new(
            key.clone(),
            self.adapters.get(&key.1),
            self.outbox.clone(),
            self.cfg.clone(),
            self.actors.clone(),
            rx,
        );
        actors.insert(key, tx);
        tokio::spawn(actor.run());
    }

    pub fn active_count(&self) -> usize {
        self.actors.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StatusActor {
    key: Key,
    adapter: Arc<dyn ChannelAdapter>,
    outbox: Arc<dyn ChannelOutbox>,
    cfg: CoalescerConfig,
    registry: ActorMap,
    rx: mpsc::UnboundedReceiver<StatusMsg>,
    ack_tx: mpsc::UnboundedSender<DeliveryAck>,
    ack_rx: mpsc::UnboundedReceiver<DeliveryAck>,

    run_id: String,
    actions: HashMap<String, ActionRecord>,
    order: Vec<String>,
    emit_seq: u64,
    first_event_at: Option<Instant>,
    flush_deadline: Option<Instant>,
    finalized: bool,
    final_flushed: bool,
    saw_any_action: bool,
    meta: CoalescerMeta,
    state: StatusState,
    touched: Instant,
}

impl StatusActor {
    fn new(
        key: Key,
        adapter: Arc<dyn ChannelAdapter>,
        outbox: Arc<dyn ChannelOutbox>,
        cfg: CoalescerConfig,
        registry: ActorMap,
        rx: mpsc::UnboundedReceiver<StatusMsg>,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        Self {
            key,
            adapter,
            outbox,
            cfg,
            registry,
            rx,
            ack_tx,
            ack_rx,
            run_id: String::new(),
            actions: HashMap::new(),
            order: Vec::new(),
            emit_seq: 0,
            first_event_at: None,
            flush_deadline: None,
            finalized: false,
            final_flushed: false,
            saw_any_action: false,
            meta: CoalescerMeta::default(),
            state: StatusState::default(),
            touched: Instant::now(),
        }
    }

    async fn run(mut self) {
        loop {
            let flush_at = self.flush_deadline.unwrap_or_else(far_future);
            let teardown_at = self.touched + Duration::from_millis(self.cfg.teardown_idle_ms);
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.touched = Instant::now();
                    self.handle(msg).await;
                }
                Some(ack) = self.ack_rx.recv() => {
                    self.touched = Instant::now();
                    self.handle_ack(ack).await;
                }
                _ = tokio::time::sleep_until(flush_at), if self.flush_deadline.is_some() => {
                    self.flush_deadline = None;
                    self.flush().await;
                }
                _ = tokio::time::sleep_until(teardown_at), if self.finalized => {
                    let mut actors = self.registry.lock();
                    if self.rx.is_empty() {
                        actors.remove(&self.key);
                        drop(actors);
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: StatusMsg) {
        match msg {
            StatusMsg::Action {
                run_id,
                action,
                meta,
            } => self.handle_action(run_id, action, meta).await,
            StatusMsg::Finalize { run_id, ok, meta } => {
                self.handle_finalize(run_id, ok, meta).await
            }
            StatusMsg::Flush => {
                self.flush_deadline = None;
                self.flush().await;
            }
        }
    }

    fn reset_for_run(&mut self, run_id: String) {
        self.run_id = run_id;
        self.actions.clear();
        self.order.clear();
        self.emit_seq = 0;
        self.first_event_at = None;
        self.flush_deadline = None;
        self.finalized = false;
        self.final_flushed = false;
        self.saw_any_action = false;
        self.state = StatusState::default();
    }

    async fn handle_action(&mut self, run_id: String, action: ActionRecord, meta: CoalescerMeta) {
        if run_id != self.run_id {
            self.reset_for_run(run_id);
        }
        self.meta.merge_compact(&meta);
        if self.finalized {
            return;
        }
        self.saw_any_action = true;

        match self.actions.get_mut(&action.id) {
            Some(existing) => existing.absorb(action),
            None => {
                self.order.push(action.id.clone());
                self.actions.insert(action.id.clone(), action);
                while self.order.len() > self.cfg.max_actions {
                    let oldest = self.order.remove(0);
                    self.actions.remove(&oldest);
                }
            }
        }

        let now = Instant::now();
        let first = *self.first_event_at.get_or_insert(now);
        if now.duration_since(first) >= Duration::from_millis(self.cfg.max_latency_ms) {
            self.flush_deadline = None;
            self.flush().await;
        } else {
            self.flush_deadline = Some(now + Duration::from_millis(self.cfg.idle_ms));
        }
    }

    fn render(&self) -> String {
        let (omitted, window) = self.adapter.limit_order(&self.order);
        let records: Vec<&ActionRecord> = window
            .iter()
            .filter_map(|id| self.actions.get(id))
            .collect();
        let mut text = render_status(&records, omitted, self.adapter.as_ref());
        let any_running = self.actions.values().any(ActionRecord::is_running);
        if any_running && self.meta.progress_msg_id.is_some() {
            text = format!("Running\u{2026}\n\n{text}");
        }
        text
    }

    async fn flush(&mut self) {
        if self.order.is_empty() || self.final_flushed {
            return;
        }
        let text = self.render();
        // Identical renders are suppressed, except the finalize pass: it
        // must still go out to drop the cancel button.
        if !self.finalized && self.state.last_text.as_deref() == Some(text.as_str()) {
            return;
        }
        let Some((account_id, peer)) = super::stream_addressing(&self.meta) else {
            return;
        };
        self.emit_seq += 1;
        let mut cx = StatusEmitCtx {
            target: EmitTarget {
                outbox: self.outbox.as_ref(),
                channel_id: &self.key.1,
                account_id: &account_id,
                peer: &peer,
                run_id: &self.run_id,
                session_key: &self.key.0,
            },
            seq: self.emit_seq,
            text: &text,
            finalized: self.finalized,
            meta: &mut self.meta,
            state: &mut self.state,
            ack_tx: &self.ack_tx,
        };
        self.adapter.emit_tool_status(&mut cx).await;
        self.first_event_at = None;
        if self.finalized {
            self.final_flushed = true;
        }
    }

    async fn handle_finalize(&mut self, run_id: String, ok: bool, meta: CoalescerMeta) {
        if run_id != self.run_id {
            self.reset_for_run(run_id);
        }
        self.meta.merge_compact(&meta);
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.flush_deadline = None;

        if !self.saw_any_action {
            // No tool ran.  Only a dangling progress message warrants a
            // terminal edit.
            if let Some(progress_id) = self.meta.progress_msg_id.clone() {
                if let Some((account_id, peer)) = super::stream_addressing(&self.meta) {
                    let target = EmitTarget {
                        outbox: self.outbox.as_ref(),
                        channel_id: &self.key.1,
                        account_id: &account_id,
                        peer: &peer,
                        run_id: &self.run_id,
                        session_key: &self.key.0,
                    };
                    let payload = target.payload(
                        OutboundContent::Edit {
                            message_id: progress_id,
                            text: "Done".to_owned(),
                        },
                        None,
                        format!("{}:status:final", self.run_id),
                        None,
                        true,
                        Some(ReplyMarkup::cleared()),
                    );
                    enqueue_best_effort(self.outbox.as_ref(), payload).await;
                }
            }
            return;
        }

        for action in self.actions.values_mut() {
            if action.is_running() {
                action.phase = ActionPhase::Completed;
                action.ok = Some(ok);
            }
        }
        self.flush().await;
    }

    async fn handle_ack(&mut self, ack: DeliveryAck) {
        let Some((account_id, peer)) = super::stream_addressing(&self.meta) else {
            return;
        };
        let markup = self
            .adapter
            .tool_status_reply_markup(&self.run_id, self.finalized);
        let cx = AckCtx {
            target: EmitTarget {
                outbox: self.outbox.as_ref(),
                channel_id: &self.key.1,
                account_id: &account_id,
                peer: &peer,
                run_id: &self.run_id,
                session_key: &self.key.0,
            },
            ack,
            create_ref: &mut self.state.status_create_ref,
            msg_id_slot: &mut self.state.status_msg_id,
            deferred_text: &mut self.state.deferred_text,
            last_text: &mut self.state.last_text,
            phase: "status",
            seq: self.emit_seq,
            reply_markup: markup,
        };
        self.adapter.handle_delivery_ack(cx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TelegramAdapter;
    use crate::outbox::MemoryOutbox;
    use crate::telegram_state::TelegramState;
    use lemon_domain::config::TelegramConfig;
    use lemon_domain::event::ActionDetail;
    use lemon_domain::Peer;
    use lemon_sessions::MemoryKv;

    fn telegram_world() -> (StatusCoalescers, Arc<MemoryOutbox>) {
        let adapters = Arc::new(ChannelAdapterRegistry::new());
        adapters.register(Arc::new(TelegramAdapter::new(
            Arc::new(TelegramState::new(Arc::new(MemoryKv::new()))),
            TelegramConfig::default(),
        )));
        let outbox = Arc::new(MemoryOutbox::new());
        let co = StatusCoalescers::new(adapters, outbox.clone(), CoalescerConfig::default());
        (co, outbox)
    }

    fn meta(peer: &str) -> CoalescerMeta {
        CoalescerMeta {
            account_id: Some("default".into()),
            peer: Some(Peer::dm(peer)),
            user_msg_id: Some("u1".into()),
            ..Default::default()
        }
    }

    fn action(id: &str, title: &str, phase: ActionPhase) -> ActionRecord {
        ActionRecord {
            id: id.into(),
            kind: ActionKind::Tool,
            title: title.into(),
            phase,
            ok: None,
            detail: ActionDetail::default(),
            caller_engine: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_creates_then_edits_status_message() {
        let (co, outbox) = world_scenario().await;

        // First flush created the status message with the cancel button.
        let sent = outbox.sent();
        assert!(sent.len() >= 2, "expected create + edit, got {sent:?}");
        match &sent[0].content {
            OutboundContent::Text { text } => {
                assert!(text.contains("- [running] Read: foo.txt"));
            }
            other => panic!("expected text create, got {other:?}"),
        }
        let markup = sent[0].meta.reply_markup.as_ref().unwrap();
        assert_eq!(markup.rows[0][0].callback_data, "lemon:cancel:r1");

        // The completion edit converges on the final line.
        match &sent[1].content {
            OutboundContent::Edit { message_id, text } => {
                assert_eq!(message_id, "m1");
                assert_eq!(text, "Tool calls:\n- [ok] Read: foo.txt -> ok");
            }
            other => panic!("expected edit, got {other:?}"),
        }
        drop(co);
    }

    async fn world_scenario() -> (StatusCoalescers, Arc<MemoryOutbox>) {
        let (co, outbox) = telegram_world();
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("a1", "Read: foo.txt", ActionPhase::Started),
            meta("42"),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut done = action("a1", "Read: foo.txt", ActionPhase::Completed);
        done.ok = Some(true);
        done.detail.result_preview = Some("ok".into());
        co.ingest_action("sk", "telegram", "r1", done, meta("42"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        (co, outbox)
    }

    #[tokio::test(start_paused = true)]
    async fn note_and_anonymous_actions_filtered() {
        let (co, outbox) = telegram_world();
        let mut note = action("n1", "thinking", ActionPhase::Started);
        note.kind = ActionKind::Note;
        co.ingest_action("sk", "telegram", "r1", note, meta("42"));
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("", "anon", ActionPhase::Started),
            meta("42"),
        );
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outbox.sent_len(), 0);
        assert_eq!(co.active_count(), 0, "filtered actions never spawn actors");
    }

    #[tokio::test(start_paused = true)]
    async fn action_window_drops_oldest() {
        let adapters = Arc::new(ChannelAdapterRegistry::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let cfg = CoalescerConfig {
            max_actions: 3,
            ..Default::default()
        };
        let co = StatusCoalescers::new(adapters, outbox.clone(), cfg);
        for i in 0..5 {
            co.ingest_action(
                "sk",
                "irc",
                "r1",
                action(&format!("a{i}"), &format!("T{i}"), ActionPhase::Started),
                meta("42"),
            );
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        let sent = outbox.sent();
        let text = sent.last().unwrap().content.text().unwrap();
        assert!(!text.contains("T0"));
        assert!(!text.contains("T1"));
        assert!(text.contains("T2") && text.contains("T4"));
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_without_actions_is_noop_unless_progress_dangles() {
        let (co, outbox) = telegram_world();
        co.finalize_run("sk", "telegram", "r1", true, meta("42"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outbox.sent_len(), 0, "no actions, no progress: silent");

        let mut m = meta("42");
        m.progress_msg_id = Some("p7".into());
        co.finalize_run("sk", "telegram", "r2", true, m);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].content {
            OutboundContent::Edit { message_id, text } => {
                assert_eq!(message_id, "p7");
                assert_eq!(text, "Done");
            }
            other => panic!("expected edit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finalize_marks_running_actions_with_run_ok() {
        let (co, outbox) = telegram_world();
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("a1", "Slow tool", ActionPhase::Started),
            meta("42"),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        co.finalize_run("sk", "telegram", "r1", false, meta("42"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = outbox.sent();
        let last_text = sent.last().unwrap().content.text().unwrap();
        assert!(last_text.contains("- [err] Slow tool"), "text: {last_text}");
        // Finalize clears the cancel button.
        let markup = sent.last().unwrap().meta.reply_markup.as_ref().unwrap();
        assert!(markup.is_cleared());
    }

    #[tokio::test(start_paused = true)]
    async fn running_prefix_with_progress_message() {
        let (co, outbox) = telegram_world();
        let mut m = meta("42");
        m.progress_msg_id = Some("p1".into());
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("a1", "Read", ActionPhase::Started),
            m,
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = outbox.sent();
        assert!(sent[0]
            .content
            .text()
            .unwrap()
            .starts_with("Running\u{2026}\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_render_suppressed() {
        let (co, outbox) = telegram_world();
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("a1", "Read", ActionPhase::Started),
            meta("42"),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        // Re-ingest the same record: render is identical, no new payload.
        co.ingest_action(
            "sk",
            "telegram",
            "r1",
            action("a1", "Read", ActionPhase::Started),
            meta("42"),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(outbox.sent_len(), 1);
    }
}
