//! Bounded run supervision and the run-id registry.
//!
//! The supervisor caps concurrent run processes; exceeding the cap is the
//! `run_capacity_reached` backpressure signal.  The registry is the weak
//! mapping `run_id -> actor inbox` used for aborts; entries are removed
//! when a run terminates.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use lemon_domain::{Error, Result};

use super::RunMsg;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunSupervisor {
    /// Maximum concurrent children.  `0` = unlimited.
    max_children: usize,
    active: Arc<AtomicUsize>,
}

impl RunSupervisor {
    pub fn new(max_children: usize) -> Self {
        Self {
            max_children,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a run task if capacity allows.
    pub fn try_spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let prior = self.active.fetch_add(1, Ordering::AcqRel);
        if self.max_children > 0 && prior >= self.max_children {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::RunCapacityReached);
        }
        let active = self.active.clone();
        tokio::spawn(async move {
            fut.await;
            active.fetch_sub(1, Ordering::AcqRel);
        });
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct RunRegistry {
    inner: Mutex<HashMap<String, mpsc::UnboundedSender<RunMsg>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str, tx: mpsc::UnboundedSender<RunMsg>) {
        self.inner.lock().insert(run_id.to_owned(), tx);
    }

    pub fn remove(&self, run_id: &str) {
        self.inner.lock().remove(run_id);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().contains_key(run_id)
    }

    /// Cast an abort to a live run process.  Returns false for unknown or
    /// already-gone runs.
    pub fn abort(&self, run_id: &str) -> bool {
        let inner = self.inner.lock();
        match inner.get(run_id) {
            Some(tx) => tx.send(RunMsg::Abort).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
