use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::{EventType, WorkflowEvent};

struct Subscriber {
    tx: flume::Sender<Arc<WorkflowEvent>>,
    /// `None` receives everything.
    filter: Option<Vec<EventType>>,
}

impl Subscriber {
    fn wants(&self, event_type: EventType) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |types| types.contains(&event_type))
    }
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver that
/// will receive all events published after the subscription was created.
/// Delivery is synchronous and follows registration order; receivers are
/// unbounded so publishing never blocks the publisher. Subscribers that need
/// slow processing must drain their receiver on their own task.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // Subscribers never panic while holding the lock, but recover anyway.
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new subscriber that receives every event.
    pub fn subscribe(&self) -> flume::Receiver<Arc<WorkflowEvent>> {
        self.register(None)
    }

    /// Register a subscriber that only receives the given event types.
    pub fn subscribe_to(&self, types: &[EventType]) -> flume::Receiver<Arc<WorkflowEvent>> {
        self.register(Some(types.to_vec()))
    }

    fn register(&self, filter: Option<Vec<EventType>>) -> flume::Receiver<Arc<WorkflowEvent>> {
        let (tx, rx) = flume::unbounded();
        self.lock().push(Subscriber { tx, filter });
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// automatically pruned.
    pub fn publish(&self, event: WorkflowEvent) {
        let event = Arc::new(event);
        let mut subscribers = self.lock();
        subscribers.retain(|sub| {
            if sub.wants(event.event_type) {
                sub.tx.send(Arc::clone(&event)).is_ok()
            } else {
                !sub.tx.is_disconnected()
            }
        });
        tracing::trace!(
            event_type = %event.event_type,
            subscribers = subscribers.len(),
            "event published"
        );
    }

    /// Convenience for `publish(WorkflowEvent::new(..).with_data(..))`.
    pub fn emit(&self, event_type: EventType, message: impl Into<String>, data: serde_json::Value) {
        self.publish(WorkflowEvent::new(event_type, message).with_data(data));
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
