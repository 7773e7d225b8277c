//! Event Hub
//!
//! Fan-out of connection and state events to registered listeners. `fire`
//! never waits on a listener: events go onto a channel drained by a single
//! delivery task, so listeners see them in the order they were fired.

use crate::domain::models::{DeviceEvent, EventKind};
use crate::infrastructure::lock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

pub type EventListener = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

type Delivery = (Vec<EventListener>, DeviceEvent);

/// Handle returned by [`EventHub::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, EventListener)>>>,
    next_id: AtomicU64,
    /// Feeds the delivery task; started on the first `fire` inside a runtime
    delivery: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners)
            .entry(kind)
            .or_default()
            .push((id, listener));
        id
    }

    /// Returns false if the listener was not registered for `kind`
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.listeners).get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    /// Events reach listeners in the order they were fired.
    pub fn fire(&self, event: DeviceEvent) {
        let targets: Vec<EventListener> = lock(&self.listeners)
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        if targets.is_empty() {
            return;
        }

        trace!("Firing {:?} to {} listener(s)", event.kind(), targets.len());

        // Held across the send so concurrent callers cannot interleave
        let mut delivery = lock(&self.delivery);
        let mut pending = (targets, event);
        if let Some(tx) = delivery.as_ref() {
            match tx.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => pending = returned,
            }
        }

        match Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(deliver(rx));
                // The receiver is alive until the task sees the sender dropped
                let _ = tx.send(pending);
                *delivery = Some(tx);
            }
            Err(_) => {
                *delivery = None;
                drop(delivery);
                let (targets, event) = pending;
                notify(&targets, &event);
            }
        }
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some((targets, event)) = rx.recv().await {
        notify(&targets, &event);
    }
}

fn notify(targets: &[EventListener], event: &DeviceEvent) {
    for listener in targets {
        let call = panic::catch_unwind(AssertUnwindSafe(|| listener(event.clone())));
        if call.is_err() {
            warn!("Listener for {:?} panicked", event.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_listener(tx: mpsc::UnboundedSender<DeviceEvent>) -> EventListener {
        Arc::new(move |event| {
            let _ = tx.send(event);
        })
    }

    #[tokio::test]
    async fn test_fire_reaches_listeners_of_kind() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(EventKind::Connected, channel_listener(tx.clone()));
        hub.add_listener(EventKind::StateChanged, channel_listener(tx));

        hub.fire(DeviceEvent::Connected);
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(DeviceEvent::Connected));

        hub.fire(DeviceEvent::Disconnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_listeners_all_called() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(EventKind::StateChanged, channel_listener(tx.clone()));
        hub.add_listener(EventKind::StateChanged, channel_listener(tx));

        hub.fire(DeviceEvent::StateChanged(DeviceState::default()));
        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert!(matches!(got, Some(DeviceEvent::StateChanged(_))));
        }
    }

    #[test]
    fn test_remove_listener() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.add_listener(EventKind::Disconnected, channel_listener(tx));
        assert_eq!(hub.listener_count(EventKind::Disconnected), 1);

        assert!(!hub.remove_listener(EventKind::Connected, id));
        assert!(hub.remove_listener(EventKind::Disconnected, id));
        assert!(!hub.remove_listener(EventKind::Disconnected, id));

        // No runtime here, so delivery would be inline
        hub.fire(DeviceEvent::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fire_without_runtime_is_inline() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(EventKind::Connected, channel_listener(tx));
        hub.fire(DeviceEvent::Connected);
        assert_eq!(rx.try_recv().ok(), Some(DeviceEvent::Connected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_arrive_in_fire_order() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(EventKind::StateChanged, channel_listener(tx));

        for speed in 0..100u8 {
            hub.fire(DeviceEvent::StateChanged(DeviceState {
                speed,
                ..Default::default()
            }));
        }

        let mut speeds = Vec::new();
        while speeds.len() < 100 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            match got {
                Some(DeviceEvent::StateChanged(state)) => speeds.push(state.speed),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(speeds, (0..100).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_delivery() {
        let hub = EventHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add_listener(
            EventKind::Connected,
            Arc::new(|_: DeviceEvent| panic!("listener bug")),
        );
        hub.add_listener(EventKind::Connected, channel_listener(tx));

        hub.fire(DeviceEvent::Connected);
        hub.fire(DeviceEvent::Connected);
        for _ in 0..2 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            assert_eq!(got, Some(DeviceEvent::Connected));
        }
    }
}
