use denis_core::EventV1;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub const DEFAULT_MAX_BUFFERED: usize = 200;

struct Subscriber {
    conn_id: u64,
    max_buffered: usize,
    sender: mpsc::Sender<EventV1>,
}

impl Subscriber {
    /// Non-blocking enqueue honoring the reserved error slot: the channel is
    /// sized `max_buffered + 1`, and ordinary events may never take the last
    /// permit so a `backpressure_drop` notice can still reach the client.
    fn try_enqueue(&self, event: EventV1) -> Result<(), EventV1> {
        if self.sender.capacity() <= 1 {
            return Err(event);
        }
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => Err(event),
        }
    }
}

/// One registered WebSocket subscriber. The owning handler drains the queue;
/// the hub only ever enqueues without blocking.
pub struct Subscription {
    pub conn_id: u64,
    pub conversation_id: String,
    sender: mpsc::Sender<EventV1>,
    receiver: mpsc::Receiver<EventV1>,
}

impl Subscription {
    /// Non-blocking enqueue used for replaying persisted events into the
    /// same queue live events land in. False when the queue is full.
    pub fn try_enqueue(&self, event: EventV1) -> bool {
        if self.sender.capacity() <= 1 {
            return false;
        }
        self.sender.try_send(event).is_ok()
    }

    pub async fn recv(&mut self) -> Option<EventV1> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EventV1> {
        self.receiver.try_recv().ok()
    }
}

/// In-memory fan-out registry keyed by `conversation_id`.
///
/// `publish` snapshots the subscriber list under a short lock and then
/// enqueues lock-free; a full queue replaces the event with a synthetic
/// `backpressure_drop` error. Publishers never block on slow clients.
pub struct EventHub {
    conn_counter: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<Arc<Subscriber>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, conversation_id: &str, max_buffered: usize) -> Subscription {
        let capacity = max_buffered.max(1);
        // One extra permit is reserved for the synthetic backpressure error.
        let (sender, receiver) = mpsc::channel(capacity + 1);
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let subscriber = Arc::new(Subscriber {
            conn_id,
            max_buffered: capacity,
            sender: sender.clone(),
        });
        self.lock()
            .entry(conversation_id.to_string())
            .or_default()
            .push(subscriber);

        debug!(
            event = "hub_register",
            conn_id,
            conversation_id,
            max_buffered = capacity
        );
        Subscription {
            conn_id,
            conversation_id: conversation_id.to_string(),
            sender,
            receiver,
        }
    }

    pub fn unregister(&self, subscription: &Subscription) {
        let mut map = self.lock();
        if let Some(entries) = map.get_mut(&subscription.conversation_id) {
            entries.retain(|sub| sub.conn_id != subscription.conn_id);
            if entries.is_empty() {
                map.remove(&subscription.conversation_id);
            }
        }
        debug!(
            event = "hub_unregister",
            conn_id = subscription.conn_id,
            conversation_id = %subscription.conversation_id
        );
    }

    pub fn publish(&self, conversation_id: &str, event: &EventV1) {
        let snapshot: Vec<Arc<Subscriber>> = {
            let map = self.lock();
            map.get(conversation_id).cloned().unwrap_or_default()
        };

        for subscriber in snapshot {
            if subscriber.sender.is_closed() {
                warn!(
                    event = "subscriber_gone",
                    conn_id = subscriber.conn_id,
                    conversation_id
                );
                continue;
            }
            if subscriber.try_enqueue(event.clone()).is_err() {
                warn!(
                    event = "backpressure_drop",
                    conn_id = subscriber.conn_id,
                    conversation_id,
                    r#type = %event.r#type
                );
                let err = backpressure_event(conversation_id, event, subscriber.max_buffered);
                let _ = subscriber.sender.try_send(err);
            }
        }
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.lock()
            .get(conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Arc<Subscriber>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Synthetic ephemeral error replacing an event a slow subscriber missed.
/// Never persisted, `event_id` stays 0.
fn backpressure_event(conversation_id: &str, dropped: &EventV1, max_buffered: usize) -> EventV1 {
    let correlation_id = if dropped.correlation_id.is_empty() {
        "backpressure".to_string()
    } else {
        dropped.correlation_id.clone()
    };
    let turn_id = if dropped.turn_id.is_empty() {
        correlation_id.clone()
    } else {
        dropped.turn_id.clone()
    };

    let mut payload = serde_json::Map::new();
    payload.insert("code".to_string(), Value::String("backpressure_drop".into()));
    payload.insert(
        "msg".to_string(),
        Value::String("Dropped event due to slow client".into()),
    );
    payload.insert(
        "detail".to_string(),
        serde_json::json!({ "max_buffered": max_buffered }),
    );

    EventV1::synthetic_error(
        conversation_id,
        &correlation_id,
        &turn_id,
        dropped.trace_id.clone(),
        payload,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use denis_core::{Channel, Severity};
    use serde_json::Map;

    fn sample_event(event_type: &str, correlation_id: &str) -> EventV1 {
        EventV1 {
            event_id: 0,
            ts: denis_core::utc_now_iso(),
            conversation_id: "default".to_string(),
            emitter: denis_core::EMITTER_PERSONA.to_string(),
            correlation_id: correlation_id.to_string(),
            turn_id: "turn-1".to_string(),
            trace_id: None,
            channel: Channel::infer(event_type),
            stored: true,
            r#type: event_type.to_string(),
            severity: Severity::Info,
            schema_version: denis_core::SCHEMA_VERSION.to_string(),
            ui_hint: denis_core::event::default_ui_hint(),
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn publish_preserves_per_subscriber_order() {
        let hub = EventHub::new();
        let mut sub = hub.register("conv", 10);
        for n in 0..3 {
            hub.publish("conv", &sample_event(&format!("ops.metric{n}"), "c"));
        }
        for n in 0..3 {
            let ev = sub.recv().await.expect("event");
            assert_eq!(ev.r#type, format!("ops.metric{n}"));
        }
    }

    #[tokio::test]
    async fn full_queue_yields_single_backpressure_error() {
        let hub = EventHub::new();
        let mut sub = hub.register("conv", 1);
        hub.publish("conv", &sample_event("chat.message", "corr-a"));
        hub.publish("conv", &sample_event("run.step", "corr-b"));
        hub.publish("conv", &sample_event("ops.metric", "corr-c"));

        let first = sub.recv().await.expect("first event");
        assert_eq!(first.r#type, "chat.message");

        let second = sub.recv().await.expect("backpressure event");
        assert_eq!(second.r#type, "error");
        assert_eq!(second.event_id, 0);
        assert!(!second.stored);
        assert_eq!(second.severity, Severity::Warning);
        assert_eq!(second.payload["code"], "backpressure_drop");
        assert_eq!(second.payload["detail"]["max_buffered"], 1);
        assert_eq!(second.correlation_id, "corr-b");

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let hub = EventHub::new();
        let mut slow = hub.register("conv", 1);
        let mut fast = hub.register("conv", 10);
        for n in 0..3 {
            hub.publish("conv", &sample_event(&format!("ops.metric{n}"), "c"));
        }
        // The fast subscriber gets everything despite the slow one dropping.
        for n in 0..3 {
            let ev = fast.recv().await.expect("event");
            assert_eq!(ev.r#type, format!("ops.metric{n}"));
        }
        assert_eq!(slow.recv().await.expect("event").r#type, "ops.metric0");
    }

    #[tokio::test]
    async fn unregister_removes_subscriber() {
        let hub = EventHub::new();
        let sub = hub.register("conv", 4);
        assert_eq!(hub.subscriber_count("conv"), 1);
        hub.unregister(&sub);
        assert_eq!(hub.subscriber_count("conv"), 0);
        // Publishing to an empty conversation is a no-op.
        hub.publish("conv", &sample_event("chat.message", "c"));
    }

    #[tokio::test]
    async fn replay_enqueue_shares_the_live_queue() {
        let hub = EventHub::new();
        let mut sub = hub.register("conv", 4);
        assert!(sub.try_enqueue(sample_event("chat.message", "replayed")));
        hub.publish("conv", &sample_event("run.step", "live"));

        assert_eq!(sub.recv().await.expect("replayed").correlation_id, "replayed");
        assert_eq!(sub.recv().await.expect("live").correlation_id, "live");
    }
}
