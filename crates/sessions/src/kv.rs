//! Opaque key/value store.
//!
//! Approvals, session policies, Telegram per-chat state and the session
//! directory all read and write through this trait; callers treat a lookup
//! failure the same as an absent key.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value);
    fn delete(&self, key: &str);
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

/// In-memory store.  The reference implementation and the default for a
/// single-node deployment.
#[derive(Default)]
pub struct MemoryKv {
    inner: RwLock<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: Value) {
        self.inner.write().insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        self.inner.write().remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}
