//! Fan-out of relay events to connected observers.
//!
//! One tokio broadcast channel carries every event; each observer holds an
//! independent receiver buffering up to `capacity` events. An observer that
//! falls further behind loses the oldest events, and the loss is counted.
//! Nothing is replayed to observers that connect later.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::model::now_millis;
use crate::protocol::RelayEvent;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub active_observers: usize,
}

/// Lock-free counters for the publish path.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

/// A connected observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverInfo {
    pub observer_id: Uuid,
    /// Free-form label for logs (remote address, test name…)
    pub label: String,
    pub connected_at: u64,
}

impl ObserverInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            observer_id: Uuid::new_v4(),
            label: label.into(),
            connected_at: now_millis(),
        }
    }
}

/// An event in flight, tagged with the observer that caused it.
struct Delivery {
    origin: Option<Uuid>,
    event: RelayEvent,
}

pub struct Broadcaster {
    sender: broadcast::Sender<Arc<Delivery>>,
    observers: RwLock<HashMap<Uuid, ObserverInfo>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    /// `capacity` is the number of events buffered per observer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Register an observer. It receives every event published from now on.
    pub async fn connect(&self, info: ObserverInfo) -> Subscription {
        let observer_id = info.observer_id;
        let mut observers = self.observers.write().await;
        log::debug!("Observer {observer_id} connected ({})", info.label);
        observers.insert(observer_id, info);
        Subscription {
            observer_id,
            receiver: self.sender.subscribe(),
            stats: self.atomic_stats.clone(),
        }
    }

    pub async fn disconnect(&self, observer_id: &Uuid) -> Option<ObserverInfo> {
        let removed = self.observers.write().await.remove(observer_id);
        if removed.is_some() {
            log::debug!("Observer {observer_id} disconnected");
        }
        removed
    }

    /// Publish to every observer. Returns the number of receivers reached.
    pub fn publish(&self, event: RelayEvent) -> usize {
        self.send(None, event)
    }

    /// Publish to every observer except `origin`.
    pub fn publish_from(&self, origin: Uuid, event: RelayEvent) -> usize {
        self.send(Some(origin), event)
    }

    fn send(&self, origin: Option<Uuid>, event: RelayEvent) -> usize {
        log::trace!("Publishing {}", event.name());
        let count = self
            .sender
            .send(Arc::new(Delivery { origin, event }))
            .unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn observers(&self) -> Vec<ObserverInfo> {
        self.observers.read().await.values().cloned().collect()
    }

    pub async fn is_connected(&self, observer_id: &Uuid) -> bool {
        self.observers.read().await.contains_key(observer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.atomic_stats.events_dropped.load(Ordering::Relaxed),
            active_observers: self.observers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Receiving side of one observer.
pub struct Subscription {
    observer_id: Uuid,
    receiver: broadcast::Receiver<Arc<Delivery>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    pub fn observer_id(&self) -> Uuid {
        self.observer_id
    }

    /// Next event not caused by this observer. `None` once the broadcaster
    /// is gone.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) => {
                    if delivery.origin == Some(self.observer_id) {
                        continue; // Skip own events
                    }
                    return Some(delivery.event.clone());
                }
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Like `recv`, without waiting.
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(delivery) => {
                    if delivery.origin == Some(self.observer_id) {
                        continue;
                    }
                    return Some(delivery.event.clone());
                }
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, n: u64) {
        log::warn!("Observer {} lagged by {n} events", self.observer_id);
        self.stats.events_dropped.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::TypingNotice;

    fn typing(user: &str) -> RelayEvent {
        RelayEvent::Typing(TypingNotice::started(Uuid::nil(), user, user))
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let broadcaster = Broadcaster::new(16);
        let info = ObserverInfo::new("alice");
        let id = info.observer_id;

        let _sub = broadcaster.connect(info).await;
        assert_eq!(broadcaster.observer_count().await, 1);
        assert!(broadcaster.is_connected(&id).await);

        assert!(broadcaster.disconnect(&id).await.is_some());
        assert_eq!(broadcaster.observer_count().await, 0);
        assert!(broadcaster.disconnect(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_to_all() {
        let broadcaster = Broadcaster::new(16);
        let mut a = broadcaster.connect(ObserverInfo::new("a")).await;
        let mut b = broadcaster.connect(ObserverInfo::new("b")).await;

        assert_eq!(broadcaster.publish(typing("u1")), 2);
        assert_eq!(a.recv().await, Some(typing("u1")));
        assert_eq!(b.recv().await, Some(typing("u1")));
    }

    #[tokio::test]
    async fn test_publish_from_skips_origin() {
        let broadcaster = Broadcaster::new(16);
        let mut sender = broadcaster.connect(ObserverInfo::new("sender")).await;
        let mut other = broadcaster.connect(ObserverInfo::new("other")).await;

        broadcaster.publish_from(sender.observer_id(), typing("u1"));
        broadcaster.publish(typing("u2"));

        assert_eq!(other.recv().await, Some(typing("u1")));
        assert_eq!(sender.recv().await, Some(typing("u2")));
        assert_eq!(sender.try_recv(), None);
    }

    #[tokio::test]
    async fn test_late_observer_sees_nothing_old() {
        let broadcaster = Broadcaster::new(16);
        broadcaster.publish(typing("early"));
        let mut late = broadcaster.connect(ObserverInfo::new("late")).await;
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_lagging_observer_counts_drops() {
        let broadcaster = Broadcaster::new(2);
        let mut slow = broadcaster.connect(ObserverInfo::new("slow")).await;
        for i in 0..5 {
            broadcaster.publish(typing(&format!("u{i}")));
        }

        // Oldest three are gone; the newest two remain
        assert_eq!(slow.recv().await, Some(typing("u3")));
        assert_eq!(slow.recv().await, Some(typing("u4")));

        let stats = broadcaster.stats().await;
        assert_eq!(stats.events_sent, 5);
        assert_eq!(stats.events_dropped, 3);
        assert_eq!(stats.active_observers, 1);
    }
}
