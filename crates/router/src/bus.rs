//! In-process event bus with per-topic subscription, plus per-service ring
//! logs.
//!
//! Publishing fans out sequentially to every live subscriber of a topic and
//! prunes the dead ones.  Delivery is best-effort: a lost event must never
//! strand a run (run processes synthesize completions on their own).

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use lemon_domain::event::{BusEvent, LogLine};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn run_topic(run_id: &str) -> String {
    format!("run:{run_id}")
}

pub fn session_topic(session_key: &str) -> String {
    format!("session:{session_key}")
}

pub fn service_topic(service: &str) -> String {
    format!("service:{service}")
}

pub fn service_logs_topic(service: &str) -> String {
    format!("service:{service}:logs")
}

pub const APPROVALS_TOPIC: &str = "exec_approvals";
pub const SERVICES_TOPIC: &str = "services:all";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EventBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
}

/// Cheap-to-clone handle to the shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: std::sync::Arc<RwLock<BusInner>>,
}

/// A live subscription.  Call [`EventBus::unsubscribe`] (or drop the
/// receiver and let publish-side pruning collect it) when done.
pub struct Subscription {
    pub topic: String,
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .topics
            .entry(topic.to_owned())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            topic: topic.to_owned(),
            id,
            rx,
        }
    }

    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut inner = self.inner.write();
        if let Some(subs) = inner.topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }

    /// Fan an event out to every subscriber of a topic.  Returns how many
    /// subscribers received it.
    pub fn publish(&self, topic: &str, event: BusEvent) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let inner = self.inner.read();
            if let Some(subs) = inner.topics.get(topic) {
                for sub in subs {
                    if sub.tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(sub.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.write();
            if let Some(subs) = inner.topics.get_mut(topic) {
                subs.retain(|s| !dead.contains(&s.id));
                if subs.is_empty() {
                    inner.topics.remove(topic);
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .read()
            .topics
            .get(topic)
            .map_or(0, |subs| subs.len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogBuffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_RING_CAP: usize = 500;

/// Bounded per-service ring of log lines.  Appends also publish on the
/// service's log topic so live tails see lines as they arrive.
pub struct LogBuffer {
    rings: Mutex<HashMap<String, VecDeque<LogLine>>>,
    cap: usize,
    bus: EventBus,
}

impl LogBuffer {
    pub fn new(bus: EventBus) -> Self {
        Self::with_capacity(bus, DEFAULT_RING_CAP)
    }

    pub fn with_capacity(bus: EventBus, cap: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            cap,
            bus,
        }
    }

    pub fn append(&self, service: &str, level: &str, message: impl Into<String>) {
        let line = LogLine {
            service: service.to_owned(),
            level: level.to_owned(),
            message: message.into(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
        };
        {
            let mut rings = self.rings.lock();
            let ring = rings.entry(service.to_owned()).or_default();
            ring.push_back(line.clone());
            while ring.len() > self.cap {
                ring.pop_front();
            }
        }
        self.bus
            .publish(&service_logs_topic(service), BusEvent::Log(line));
    }

    /// The most recent `n` lines for a service, oldest first.
    pub fn tail(&self, service: &str, n: usize) -> Vec<LogLine> {
        let rings = self.rings.lock();
        rings.get(service).map_or_else(Vec::new, |ring| {
            ring.iter().rev().take(n).rev().cloned().collect()
        })
    }

    pub fn services(&self) -> Vec<String> {
        self.rings.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemon_domain::event::ServiceEvent;
    use serde_json::Value;

    fn service_event(kind: &str) -> BusEvent {
        BusEvent::Service(ServiceEvent {
            service: "svc".into(),
            kind: kind.into(),
            detail: Value::Null,
        })
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");

        assert_eq!(bus.publish("t", service_event("started")), 2);
        assert!(matches!(a.rx.recv().await.unwrap(), BusEvent::Service(_)));
        assert!(matches!(b.rx.recv().await.unwrap(), BusEvent::Service(_)));
    }

    #[tokio::test]
    async fn publish_to_empty_topic_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("nobody", service_event("x")), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe("t");
        drop(sub.rx);
        assert_eq!(bus.publish("t", service_event("x")), 0);
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe("t");
        let _b = bus.subscribe("t");
        bus.unsubscribe("t", a.id);
        assert_eq!(bus.subscriber_count("t"), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("run:1");
        let _b = bus.subscribe("run:2");
        bus.publish("run:1", service_event("x"));
        assert!(a.rx.recv().await.is_some());
        assert_eq!(bus.subscriber_count("run:2"), 1);
    }

    #[test]
    fn topic_names() {
        assert_eq!(run_topic("r1"), "run:r1");
        assert_eq!(session_topic("agent:a:main"), "session:agent:a:main");
        assert_eq!(service_logs_topic("tg"), "service:tg:logs");
    }

    #[tokio::test]
    async fn log_buffer_ring_bounds_and_tail() {
        let bus = EventBus::new();
        let logs = LogBuffer::with_capacity(bus.clone(), 3);
        for i in 0..5 {
            logs.append("svc", "info", format!("line {i}"));
        }
        let tail = logs.tail("svc", 10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "line 2");
        assert_eq!(tail[2].message, "line 4");
    }

    #[tokio::test]
    async fn log_append_publishes_to_log_topic() {
        let bus = EventBus::new();
        let logs = LogBuffer::new(bus.clone());
        let mut sub = bus.subscribe(&service_logs_topic("svc"));
        logs.append("svc", "warn", "careful");
        match sub.rx.recv().await.unwrap() {
            BusEvent::Log(line) => {
                assert_eq!(line.level, "warn");
                assert_eq!(line.message, "careful");
            }
            other => panic!("expected log event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn log_tail_unknown_service_is_empty() {
        let logs = LogBuffer::new(EventBus::new());
        assert!(logs.tail("ghost", 5).is_empty());
    }
}
