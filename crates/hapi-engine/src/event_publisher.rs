//! Fan-out of [`hapi_types::Event`]s to subscribers, with
//! per-subscriber namespace filtering, visibility-aware delivery, and
//! back-pressure coalescing of superseded `session-updated` events.
//!
//! Grounded on `at-bridge/src/event_bus.rs`'s `Arc<Mutex<Vec<Sender>>>`
//! fan-out, generalized with namespace scoping and an `OutboundQueue`
//! replacing the flume channel so a newer `session-updated` for a
//! session can evict a still-queued stale one (the calimero SSE
//! handler's per-session stream is the delivery-side counterpart this
//! feeds into: `hapi-bridge` drains each subscriber's queue into an
//! `axum::Sse` stream).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hapi_types::Event;
use tokio::sync::Notify;
use uuid::Uuid;

/// Per-connection outbound event queue. Plain `std::sync::Mutex` is
/// fine here: every critical section is a short, non-blocking deque
/// operation.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl OutboundQueue {
    fn new() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    fn push(&self, event: Event) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(key) = event.coalesce_key() {
            guard.retain(|queued| queued.coalesce_key() != Some(key));
        }
        guard.push_back(event);
        drop(guard);
        self.notify.notify_one();
    }

    /// Waits for and returns the next event, or `None` if the queue
    /// was closed (publisher side dropped) while waiting — callers
    /// use `Option` instead of an error since a closed queue just
    /// means "stop streaming", not a failure.
    pub async fn next(&self) -> Event {
        loop {
            if let Some(event) = self.inner.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<Event> {
        self.inner.lock().unwrap().pop_front()
    }
}

struct Subscriber {
    id: Uuid,
    namespace: String,
    queue: Arc<OutboundQueue>,
    visible: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub queue: Arc<OutboundQueue>,
    visible: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct EventPublisher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, namespace: impl Into<String>) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let queue = Arc::new(OutboundQueue::new());
        let visible = Arc::new(AtomicBool::new(true));
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.push(Subscriber {
            id,
            namespace: namespace.into(),
            queue: queue.clone(),
            visible: visible.clone(),
        });
        SubscriptionHandle { id, queue, visible }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Sends `event` to every subscriber in its namespace that is
    /// currently reporting `visibility=true`.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            if subscriber.namespace != event.namespace() {
                continue;
            }
            if !subscriber.visible.load(Ordering::Relaxed) {
                continue;
            }
            subscriber.queue.push(event.clone());
        }
    }
}
