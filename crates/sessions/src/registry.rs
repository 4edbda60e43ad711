//! Single-flight session registry.
//!
//! One compare-and-insert map: at most one run may hold a session key at
//! any instant.  The insert is the only contention point on the hot path
//! and holds the lock for a single map operation.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Outcome of a failed registration: the run currently holding the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyRegistered {
    pub run_id: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the session slot for a run.
    pub fn register(&self, session_key: &str, run_id: &str) -> Result<(), AlreadyRegistered> {
        let mut active = self.active.lock();
        match active.get(session_key) {
            Some(owner) if owner != run_id => Err(AlreadyRegistered {
                run_id: owner.clone(),
            }),
            _ => {
                active.insert(session_key.to_owned(), run_id.to_owned());
                Ok(())
            }
        }
    }

    /// Release the slot, but only if `run_id` still owns it.  Idempotent.
    pub fn unregister(&self, session_key: &str, run_id: &str) -> bool {
        let mut active = self.active.lock();
        if active.get(session_key).map(String::as_str) == Some(run_id) {
            active.remove(session_key);
            true
        } else {
            false
        }
    }

    /// The run currently active on a session, if any.
    pub fn active(&self, session_key: &str) -> Option<String> {
        self.active.lock().get(session_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_conflict() {
        let reg = SessionRegistry::new();
        assert!(reg.register("s1", "r1").is_ok());
        let err = reg.register("s1", "r2").unwrap_err();
        assert_eq!(err.run_id, "r1");
        assert_eq!(reg.active("s1").as_deref(), Some("r1"));
    }

    #[test]
    fn register_is_idempotent_for_owner() {
        let reg = SessionRegistry::new();
        assert!(reg.register("s1", "r1").is_ok());
        assert!(reg.register("s1", "r1").is_ok());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unregister_checks_owner() {
        let reg = SessionRegistry::new();
        reg.register("s1", "r1").unwrap();
        assert!(!reg.unregister("s1", "r2"), "non-owner must not free slot");
        assert_eq!(reg.active("s1").as_deref(), Some("r1"));
        assert!(reg.unregister("s1", "r1"));
        assert!(reg.active("s1").is_none());
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = SessionRegistry::new();
        reg.register("s1", "r1").unwrap();
        assert!(reg.unregister("s1", "r1"));
        assert!(!reg.unregister("s1", "r1"));
    }

    #[test]
    fn slot_reusable_after_release() {
        let reg = SessionRegistry::new();
        reg.register("s1", "r1").unwrap();
        reg.unregister("s1", "r1");
        assert!(reg.register("s1", "r2").is_ok());
        assert_eq!(reg.active("s1").as_deref(), Some("r2"));
    }

    #[test]
    fn independent_sessions_do_not_collide() {
        let reg = SessionRegistry::new();
        assert!(reg.register("s1", "r1").is_ok());
        assert!(reg.register("s2", "r2").is_ok());
        assert_eq!(reg.len(), 2);
    }
}
