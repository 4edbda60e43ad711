//! Stream coalescer — per-(session, channel) actor that buffers text
//! deltas into a bounded rate of outbound sends/edits.
//!
//! Flush policy: immediately once `min_chars` are buffered or the pending
//! buffer is older than `max_latency_ms`; otherwise an idle timer fires
//! after `idle_ms` without a new delta.  Out-of-order deltas
//! (`seq <= last_seq`) and deltas after finalize are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use lemon_domain::config::CoalescerConfig;
use lemon_domain::outbound::DeliveryAck;
use lemon_domain::{tail_str, ResumeToken};

use crate::adapter::{
    AckCtx, AnswerState, ChannelAdapter, ChannelAdapterRegistry, CoalescerMeta, EmitTarget,
    StreamEmitCtx, StreamFinalCtx,
};
use crate::outbox::ChannelOutbox;

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

use super::stream_addressing as addressing;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub enum StreamMsg {
    Delta {
        run_id: String,
        seq: u64,
        text: String,
        meta: CoalescerMeta,
    },
    Finalize {
        run_id: String,
        ok: bool,
        error: Option<String>,
        final_text: Option<String>,
        resume: Option<ResumeToken>,
        meta: CoalescerMeta,
    },
    /// Best-effort flush (abort teardown path).
    Flush,
}

type Key = (String, String);
type ActorMap = Arc<Mutex<HashMap<Key, mpsc::UnboundedSender<StreamMsg>>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lazily-spawned stream coalescer actors keyed by (session, channel).
pub struct StreamCoalescers {
    actors: ActorMap,
    adapters: Arc<ChannelAdapterRegistry>,
    outbox: Arc<dyn ChannelOutbox>,
    cfg: CoalescerConfig,
}

impl StreamCoalescers {
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

    pub fn ingest_delta(
        &self,
        session_key: &str,
        channel_id: &str,
        run_id: &str,
        seq: u64,
        text: String,
        meta: CoalescerMeta,
    ) {
        self.send(
            session_key,
            channel_id,
            StreamMsg::Delta {
                run_id: run_id.to_owned(),
                seq,
                text,
                meta,
            },
            true,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize_run(
        &self,
        session_key: &str,
        channel_id: &str,
        run_id: &str,
        ok: bool,
        error: Option<String>,
        final_text: Option<String>,
        resume: Option<ResumeToken>,
        meta: CoalescerMeta,
    ) {
        self.send(
            session_key,
            channel_id,
            StreamMsg::Finalize {
                run_id: run_id.to_owned(),
                ok,
                error,
                final_text,
                resume,
                meta,
            },
            true,
        );
    }

    /// Flush whatever is pending.  Does not spawn an actor that does not
    /// already exist.
    pub fn flush(&self, session_key: &str, channel_id: &str) {
        self.send(session_key, channel_id, StreamMsg::Flush, false);
    }

    /// Send under the registry lock; an actor tears down only while
    /// holding the same lock, so a queued message is never lost.
    fn send(&self, session_key: &str, channel_id: &str, msg: StreamMsg, spawn: bool) {
        let key = (session_key.to_owned(), channel_id.to_owned());
        let mut actors = self.actors.lock();
        let msg = match actors.get(&key) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                // The actor died; reclaim the message and respawn.
                Err(err) => {
                    actors.remove(&key);
                    err.0
                }
            },
            None => msg,
        };
        self.spawn_locked(&mut actors, key, msg, spawn);
    }

    fn spawn_locked(
        &self,
        actors: &mut HashMap<Key, mpsc::UnboundedSender<StreamMsg>>,
        key: Key,
        first: StreamMsg,
        spawn: bool,
    ) {
        if !spawn {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first);
        let actor = StreamActor::new(
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

struct StreamActor {
    key: Key,
    adapter: Arc<dyn ChannelAdapter>,
    outbox: Arc<dyn ChannelOutbox>,
    cfg: CoalescerConfig,
    registry: ActorMap,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
    ack_tx: mpsc::UnboundedSender<DeliveryAck>,
    ack_rx: mpsc::UnboundedReceiver<DeliveryAck>,

    run_id: String,
    buffer: String,
    full_text: String,
    last_seq: u64,
    emit_seq: u64,
    first_delta_at: Option<Instant>,
    flush_deadline: Option<Instant>,
    finalized: bool,
    meta: CoalescerMeta,
    answer: AnswerState,
    touched: Instant,
}

impl StreamActor {
    fn new(
        key: Key,
        adapter: Arc<dyn ChannelAdapter>,
        outbox: Arc<dyn ChannelOutbox>,
        cfg: CoalescerConfig,
        registry: ActorMap,
        rx: mpsc::UnboundedReceiver<StreamMsg>,
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
            buffer: String::new(),
            full_text: String::new(),
            last_seq: 0,
            emit_seq: 0,
            first_delta_at: None,
            flush_deadline: None,
            finalized: false,
            meta: CoalescerMeta::default(),
            answer: AnswerState::default(),
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
                    // Teardown handshake: under the registry lock, bail out
                    // only when nothing else was queued.
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

    async fn handle(&mut self, msg: StreamMsg) {
        match msg {
            StreamMsg::Delta {
                run_id,
                seq,
                text,
                meta,
            } => self.handle_delta(run_id, seq, text, meta).await,
            StreamMsg::Finalize {
                run_id,
                ok,
                error,
                final_text,
                resume,
                meta,
            } => {
                self.handle_finalize(run_id, ok, error, final_text, resume, meta)
                    .await
            }
            StreamMsg::Flush => {
                self.flush_deadline = None;
                self.flush().await;
            }
        }
    }

    fn reset_for_run(&mut self, run_id: String) {
        self.run_id = run_id;
        self.buffer.clear();
        self.full_text.clear();
        self.last_seq = 0;
        self.emit_seq = 0;
        self.first_delta_at = None;
        self.flush_deadline = None;
        self.finalized = false;
        self.answer = AnswerState::default();
    }

    async fn handle_delta(&mut self, run_id: String, seq: u64, text: String, meta: CoalescerMeta) {
        if run_id != self.run_id {
            self.reset_for_run(run_id);
        }
        self.meta.merge_compact(&meta);
        if self.finalized {
            return; // late delta
        }
        if seq <= self.last_seq {
            return; // out of order or replay
        }
        self.last_seq = seq;
        self.buffer.push_str(&text);
        self.full_text.push_str(&text);
        if self.full_text.len() > self.cfg.full_text_cap {
            self.full_text = tail_str(&self.full_text, self.cfg.full_text_cap).to_owned();
        }
        let now = Instant::now();
        let first = *self.first_delta_at.get_or_insert(now);

        if self.buffer.len() >= self.cfg.min_chars {
            self.flush_deadline = None;
            self.flush().await;
        } else if now.duration_since(first) >= Duration::from_millis(self.cfg.max_latency_ms) {
            self.flush_deadline = None;
            self.flush().await;
        } else {
            self.flush_deadline = Some(now + Duration::from_millis(self.cfg.idle_ms));
        }
    }

    async fn flush(&mut self) {
        if self.finalized || self.buffer.is_empty() {
            self.first_delta_at = None;
            return;
        }
        let Some((account_id, peer)) = addressing(&self.meta) else {
            // Nothing to address; drop the buffer rather than grow forever.
            self.buffer.clear();
            self.first_delta_at = None;
            return;
        };
        self.emit_seq += 1;
        let mut cx = StreamEmitCtx {
            target: EmitTarget {
                outbox: self.outbox.as_ref(),
                channel_id: &self.key.1,
                account_id: &account_id,
                peer: &peer,
                run_id: &self.run_id,
                session_key: &self.key.0,
            },
            seq: self.emit_seq,
            chunk: &self.buffer,
            full_text: &self.full_text,
            meta: &mut self.meta,
            state: &mut self.answer,
            ack_tx: &self.ack_tx,
        };
        self.adapter.emit_stream_output(&mut cx).await;
        self.buffer.clear();
        self.first_delta_at = None;
    }

    async fn handle_finalize(
        &mut self,
        run_id: String,
        ok: bool,
        error: Option<String>,
        final_text: Option<String>,
        resume: Option<ResumeToken>,
        meta: CoalescerMeta,
    ) {
        if run_id != self.run_id {
            self.reset_for_run(run_id);
        }
        self.meta.merge_compact(&meta);
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.flush_deadline = None;
        let Some((account_id, peer)) = addressing(&self.meta) else {
            return;
        };
        self.emit_seq += 1;
        let mut cx = StreamFinalCtx {
            target: EmitTarget {
                outbox: self.outbox.as_ref(),
                channel_id: &self.key.1,
                account_id: &account_id,
                peer: &peer,
                run_id: &self.run_id,
                session_key: &self.key.0,
            },
            ok,
            error,
            final_text: final_text.as_deref(),
            full_text: &self.full_text,
            buffer: &self.buffer,
            resume: resume.as_ref(),
            meta: &mut self.meta,
            state: &mut self.answer,
            ack_tx: &self.ack_tx,
        };
        self.adapter.finalize_stream(&mut cx).await;
        self.buffer.clear();
    }

    async fn handle_ack(&mut self, ack: DeliveryAck) {
        let Some((account_id, peer)) = addressing(&self.meta) else {
            return;
        };
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
            create_ref: &mut self.answer.answer_create_ref,
            msg_id_slot: &mut self.answer.answer_msg_id,
            deferred_text: &mut self.answer.deferred_answer_text,
            last_text: &mut self.answer.last_sent_text,
            phase: "answer",
            seq: self.emit_seq,
            reply_markup: None,
        };
        self.adapter.handle_delivery_ack(cx).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutbox;
    use lemon_domain::outbound::OutboundContent;
    use lemon_domain::Peer;

    fn world() -> (StreamCoalescers, Arc<MemoryOutbox>) {
        let adapters = Arc::new(ChannelAdapterRegistry::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let coalescers =
            StreamCoalescers::new(adapters, outbox.clone(), CoalescerConfig::default());
        (coalescers, outbox)
    }

    fn meta(peer: &str) -> CoalescerMeta {
        CoalescerMeta {
            account_id: Some("default".into()),
            peer: Some(Peer::dm(peer)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn min_chars_triggers_immediate_flush() {
        let (co, outbox) = world();
        let text = "x".repeat(48);
        co.ingest_delta("sk", "irc", "r1", 1, text.clone(), meta("42"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content.text(), Some(text.as_str()));
        assert_eq!(sent[0].idempotency_key, "r1:answer:1");
    }

    #[tokio::test(start_paused = true)]
    async fn small_delta_waits_for_idle_timer() {
        let (co, outbox) = world();
        co.ingest_delta("sk", "irc", "r1", 1, "hi".into(), meta("42"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(outbox.sent_len(), 0, "not flushed before idle timer");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(outbox.sent_len(), 1, "idle timer flushed");
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_and_replayed_seqs_dropped() {
        let (co, outbox) = world();
        for (seq, text) in [(1u64, "a"), (1, "b"), (0, "c"), (2, "d")] {
            co.ingest_delta("sk", "irc", "r1", seq, text.into(), meta("42"));
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        let sent = outbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content.text(), Some("ad"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_deltas_never_flush_but_timer_is_armed() {
        let (co, outbox) = world();
        for seq in 1..=5u64 {
            co.ingest_delta("sk", "irc", "r1", seq, String::new(), meta("42"));
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outbox.sent_len(), 0, "empty flush is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn late_delta_after_finalize_dropped() {
        let (co, outbox) = world();
        co.finalize_run("sk", "irc", "r1", true, None, None, None, meta("42"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        co.ingest_delta("sk", "irc", "r1", 1, "late".into(), meta("42"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(outbox.sent_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_resets_state() {
        let (co, outbox) = world();
        co.ingest_delta("sk", "irc", "r1", 5, "aaaa".into(), meta("42"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(outbox.sent_len(), 1);
        // New run starts over at seq 1.
        co.ingest_delta("sk", "irc", "r2", 1, "bbbb".into(), meta("42"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].meta.run_id, "r2");
        assert_eq!(sent[1].content.text(), Some("bbbb"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_text_capped_to_tail() {
        // Edit-capable generic channel is needed to observe full_text.
        let adapters = Arc::new(ChannelAdapterRegistry::new());
        adapters.register(Arc::new(crate::adapter::GenericAdapter::new("web", true)));
        let outbox = Arc::new(MemoryOutbox::new());
        let cfg = CoalescerConfig {
            full_text_cap: 100,
            ..Default::default()
        };
        let co = StreamCoalescers::new(adapters, outbox.clone(), cfg);
        let mut m = meta("42");
        m.progress_msg_id = Some("p1".into());

        co.ingest_delta("sk", "web", "r1", 1, "a".repeat(90), m.clone());
        co.ingest_delta("sk", "web", "r1", 2, "b".repeat(90), m.clone());
        tokio::time::sleep(Duration::from_millis(600)).await;
        let sent = outbox.sent();
        let last = sent.last().unwrap();
        let text = last.content.text().unwrap();
        assert!(text.len() <= 100);
        assert!(text.ends_with('b'), "tail preserved");
    }

    #[tokio::test(start_paused = true)]
    async fn actor_tears_down_after_finalize_idle() {
        let (co, _outbox) = world();
        co.ingest_delta("sk", "irc", "r1", 1, "hello".into(), meta("42"));
        co.finalize_run("sk", "irc", "r1", true, None, None, None, meta("42"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(co.active_count(), 1);
        tokio::time::sleep(Duration::from_millis(31_000)).await;
        assert_eq!(co.active_count(), 0, "idle finalized actor exits");
        // A fresh delta respawns the actor.
        co.ingest_delta("sk", "irc", "r2", 1, "again".into(), meta("42"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(co.active_count(), 1);
    }
}
