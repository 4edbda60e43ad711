//! Channel outbox — the abstract send side of a chat transport.
//!
//! The routing core only ever enqueues [`OutboundPayload`]s; the transport
//! behind the trait owns send/edit/delete mechanics and rate limiting.
//! Duplicate idempotency keys return [`Error::Duplicate`], which callers
//! treat as success.  An unavailable outbox drops the payload with a
//! warning and never fails the run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use lemon_domain::outbound::{DeliveryAck, OutboundContent, OutboundPayload};
use lemon_domain::{Error, Result};

/// Where delivery acks for a notified enqueue should be posted.
#[derive(Clone)]
pub struct DeliveryNotify {
    pub notify_ref: Uuid,
    pub tx: mpsc::UnboundedSender<DeliveryAck>,
}

impl DeliveryNotify {
    pub fn new(tx: mpsc::UnboundedSender<DeliveryAck>) -> Self {
        Self {
            notify_ref: Uuid::new_v4(),
            tx,
        }
    }
}

#[async_trait]
pub trait ChannelOutbox: Send + Sync {
    /// Enqueue a payload.  `Err(Duplicate)` means the idempotency key was
    /// seen before and must be treated as success.
    async fn enqueue(&self, payload: OutboundPayload) -> Result<()>;

    /// Enqueue and request a delivery ack (fresh sends report the
    /// transport-assigned message id).
    async fn enqueue_with_notify(
        &self,
        payload: OutboundPayload,
        notify: DeliveryNotify,
    ) -> Result<()>;
}

/// Enqueue, treating `Duplicate` as success and logging anything else.
/// The degraded-transport path: outbound failures never escalate.
pub async fn enqueue_best_effort(outbox: &dyn ChannelOutbox, payload: OutboundPayload) {
    let key = payload.idempotency_key.clone();
    match outbox.enqueue(payload).await {
        Ok(()) | Err(Error::Duplicate) => {}
        Err(e) => {
            tracing::warn!(error = %e, idempotency_key = %key, "outbound enqueue dropped");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryOutbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory outbox: dedups on idempotency key, records every accepted
/// payload, and acks notified sends with synthetic message ids.  The
/// reference implementation of the contract, and the transport double in
/// integration tests.
#[derive(Default)]
pub struct MemoryOutbox {
    seen: Mutex<HashSet<String>>,
    sent: Mutex<Vec<OutboundPayload>>,
    next_msg_id: AtomicU64,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every accepted payload, in enqueue order.
    pub fn sent(&self) -> Vec<OutboundPayload> {
        self.sent.lock().clone()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Payloads for one run, in enqueue order.
    pub fn sent_for_run(&self, run_id: &str) -> Vec<OutboundPayload> {
        self.sent
            .lock()
            .iter()
            .filter(|p| p.meta.run_id == run_id)
            .cloned()
            .collect()
    }

    fn accept(&self, payload: &OutboundPayload) -> Result<()> {
        let mut seen = self.seen.lock();
        if !seen.insert(payload.idempotency_key.clone()) {
            return Err(Error::Duplicate);
        }
        drop(seen);
        self.sent.lock().push(payload.clone());
        Ok(())
    }
}

#[async_trait]
impl ChannelOutbox for MemoryOutbox {
    async fn enqueue(&self, payload: OutboundPayload) -> Result<()> {
        self.accept(&payload)
    }

    async fn enqueue_with_notify(
        &self,
        payload: OutboundPayload,
        notify: DeliveryNotify,
    ) -> Result<()> {
        self.accept(&payload)?;
        let message_id = match &payload.content {
            OutboundContent::Text { .. } | OutboundContent::File { .. } => Some(format!(
                "m{}",
                self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
            )),
            OutboundContent::Edit { message_id, .. }
            | OutboundContent::Delete { message_id } => Some(message_id.clone()),
        };
        let _ = notify.tx.send(DeliveryAck {
            notify_ref: notify.notify_ref,
            ok: true,
            message_id,
        });
        Ok(())
    }
}
