//! Per-project fan-out of agent events to live observers.
//!
//! Each event is serialized once and handed to every observer of the project
//! with a non-blocking send. A closed observer is dropped; a full one misses
//! that event and is kept. The producer never waits on an observer.

mod events;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

pub use events::HubEvent;

pub type ObserverId = u64;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The observer went away; it is unregistered.
    Closed,
    /// The observer is behind; this event is skipped for it.
    Full,
}

/// Anything that can receive serialized events without blocking.
pub trait ObserverSink: Send + Sync {
    fn deliver(&self, payload: &Arc<str>) -> Result<(), DeliveryError>;
}

impl ObserverSink for mpsc::Sender<Arc<str>> {
    fn deliver(&self, payload: &Arc<str>) -> Result<(), DeliveryError> {
        self.try_send(payload.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

struct Observer {
    id: ObserverId,
    sink: Box<dyn ObserverSink>,
}

/// An observer registration backed by a bounded channel.
pub struct Subscription {
    pub id: ObserverId,
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Registry of observers keyed by project name.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    observers: Arc<DashMap<String, Vec<Observer>>>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, project: &str, sink: Box<dyn ObserverSink>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers
            .entry(project.to_string())
            .or_default()
            .push(Observer { id, sink });
        tracing::debug!(project, observer = id, "Observer registered");
        id
    }

    /// Register a channel-backed observer holding up to `capacity` events.
    pub fn subscribe(&self, project: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.register(project, Box::new(tx));
        Subscription { id, rx }
    }

    /// Remove one observer. Removing the last one drops the project entry.
    pub fn unregister(&self, project: &str, id: ObserverId) {
        if let Some(mut entry) = self.observers.get_mut(project) {
            entry.retain(|o| o.id != id);
        }
        self.observers.remove_if(project, |_, list| list.is_empty());
        tracing::debug!(project, observer = id, "Observer unregistered");
    }

    /// Deliver `event` to every observer of `project`.
    ///
    /// Delivery happens while holding the project's entry, so concurrent
    /// publishers to the same project are serialized and each observer sees
    /// events in publish order.
    pub fn publish(&self, project: &str, event: &HubEvent) {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(project, "Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };

        let Some(mut entry) = self.observers.get_mut(project) else {
            return;
        };
        entry.retain(|observer| match observer.sink.deliver(&payload) {
            Ok(()) => true,
            Err(DeliveryError::Full) => {
                tracing::warn!(
                    project,
                    observer = observer.id,
                    "Observer lagging; skipped {} event",
                    event.kind()
                );
                true
            }
            Err(DeliveryError::Closed) => {
                tracing::debug!(project, observer = observer.id, "Observer closed; removing");
                false
            }
        });
        drop(entry);
        self.observers.remove_if(project, |_, list| list.is_empty());
    }

    pub fn observer_count(&self, project: &str) -> usize {
        self.observers.get(project).map(|l| l.len()).unwrap_or(0)
    }

    pub fn has_project(&self, project: &str) -> bool {
        self.observers.contains_key(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records payloads, for checking ordering without channels.
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl ObserverSink for Recorder {
        fn deliver(&self, payload: &Arc<str>) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    struct Broken;

    impl ObserverSink for Broken {
        fn deliver(&self, _: &Arc<str>) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    #[tokio::test]
    async fn test_closed_observer_is_removed_others_still_receive() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe("p", 8);
        let b = hub.subscribe("p", 8);
        let mut c = hub.subscribe("p", 8);
        drop(b.rx);

        hub.publish("p", &HubEvent::log("hello"));

        assert_eq!(hub.observer_count("p"), 2);
        assert!(a.rx.recv().await.unwrap().contains("hello"));
        assert!(c.rx.recv().await.unwrap().contains("hello"));
    }

    #[test]
    fn test_failed_sink_removed_and_entry_dropped() {
        let hub = BroadcastHub::new();
        hub.register("p", Box::new(Broken));
        assert!(hub.has_project("p"));

        hub.publish("p", &HubEvent::log("x"));
        assert!(!hub.has_project("p"));
    }

    #[test]
    fn test_full_observer_skips_event_but_stays() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe("p", 1);

        hub.publish("p", &HubEvent::log("first"));
        hub.publish("p", &HubEvent::log("second"));

        assert_eq!(hub.observer_count("p"), 1);
        assert!(sub.rx.try_recv().unwrap().contains("first"));
        assert!(sub.rx.try_recv().is_err());

        hub.publish("p", &HubEvent::log("third"));
        assert!(sub.rx.try_recv().unwrap().contains("third"));
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let hub = BroadcastHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        hub.register("p", Box::new(Recorder(seen.clone())));

        for i in 0..20 {
            hub.publish("p", &HubEvent::log(format!("line-{i}")));
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        for (i, payload) in seen.iter().enumerate() {
            assert!(payload.contains(&format!("line-{i}\"")));
        }
    }

    #[test]
    fn test_projects_are_isolated() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe("alpha", 4);
        let mut b = hub.subscribe("beta", 4);

        hub.publish("alpha", &HubEvent::log("for alpha"));

        assert!(a.rx.try_recv().is_ok());
        assert!(b.rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_last_removes_project() {
        let hub = BroadcastHub::new();
        let first = hub.subscribe("p", 4);
        let second = hub.subscribe("p", 4);
        assert_ne!(first.id, second.id);

        hub.unregister("p", first.id);
        assert_eq!(hub.observer_count("p"), 1);
        hub.unregister("p", second.id);
        assert!(!hub.has_project("p"));

        // Unknown ids and projects are ignored.
        hub.unregister("p", 999);
        hub.unregister("nobody", 1);
    }

    #[test]
    fn test_publish_without_observers_is_noop() {
        let hub = BroadcastHub::new();
        hub.publish("ghost", &HubEvent::Warning {
            message: "nobody listening".into(),
        });
        assert_eq!(hub.observer_count("ghost"), 0);
    }
}
