use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use applet_bus::Variant;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::signals::WatchedProperty;

/// Everything a container reports to its host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ContainerEvent {
    Ready {
        instance_id: u32,
        out_of_process: bool,
    },
    AppletMove,
    AppletRemove,
    AppletLock {
        locked: bool,
    },
    ChildPropertyChanged {
        property: WatchedProperty,
        value: Variant,
    },
    /// The applet went away after being live; the host should rebuild it.
    AppletBroken,
}

impl ContainerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ContainerEvent::Ready { .. } => "ready",
            ContainerEvent::AppletMove => "applet-move",
            ContainerEvent::AppletRemove => "applet-remove",
            ContainerEvent::AppletLock { .. } => "applet-lock",
            ContainerEvent::ChildPropertyChanged { .. } => "child-property-changed",
            ContainerEvent::AppletBroken => "applet-broken",
        }
    }

    /// Detail tag for selective subscription, e.g. `child-property-changed::flags`.
    pub fn detail(&self) -> Option<WatchedProperty> {
        match self {
            ContainerEvent::ChildPropertyChanged { property, .. } => Some(*property),
            _ => None,
        }
    }
}

/// Fan-out of container events. Every subscriber owns an unbounded queue,
/// so a slow listener never loses events; it is only warned about once its
/// backlog passes `backlog_warning`.
#[derive(Debug, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    backlog_warning: usize,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::UnboundedSender<ContainerEvent>,
    detail: Option<WatchedProperty>,
    queued: Arc<AtomicUsize>,
}

impl Subscriber {
    fn wants(&self, event: &ContainerEvent) -> bool {
        match self.detail {
            Some(property) => event.detail() == Some(property),
            None => true,
        }
    }
}

impl EventBus {
    pub fn new(backlog_warning: usize) -> Self {
        Self {
            subscribers: Arc::default(),
            backlog_warning: backlog_warning.max(1),
        }
    }

    pub fn emit(&self, event: ContainerEvent) {
        trace!(target = "applet.signals", event = event.name(), "emitting event");
        self.subscribers.lock().retain(|subscriber| {
            if !subscriber.wants(&event) {
                return !subscriber.tx.is_closed();
            }
            if subscriber.tx.send(event.clone()).is_err() {
                return false;
            }
            let queued = subscriber.queued.fetch_add(1, Ordering::Relaxed) + 1;
            if queued == self.backlog_warning + 1 {
                warn!(
                    target = "applet.signals",
                    queued,
                    event = event.name(),
                    "event subscriber is falling behind"
                );
            }
            true
        });
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.register(None)
    }

    /// Only `child-property-changed` events for `property`.
    pub fn subscribe_detail(&self, property: WatchedProperty) -> EventSubscription {
        self.register(Some(property))
    }

    fn register(&self, detail: Option<WatchedProperty>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().push(Subscriber {
            tx,
            detail,
            queued: queued.clone(),
        });
        EventSubscription { rx, queued }
    }
}

#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ContainerEvent>,
    queued: Arc<AtomicUsize>,
}

impl EventSubscription {
    fn delivered(&self, event: ContainerEvent) -> ContainerEvent {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        event
    }

    /// Next event, or `None` once the container is gone.
    pub async fn recv(&mut self) -> Option<ContainerEvent> {
        let event = self.rx.recv().await?;
        Some(self.delivered(event))
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<ContainerEvent> {
        let event = self.rx.try_recv().ok()?;
        Some(self.delivered(event))
    }

    /// Events waiting to be received.
    pub fn backlog(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn drain(&mut self) -> Vec<ContainerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_subscriptions_only_see_their_property() {
        let events = EventBus::new(8);
        let mut all = events.subscribe();
        let mut flags = events.subscribe_detail(WatchedProperty::Flags);

        events.emit(ContainerEvent::AppletMove);
        events.emit(ContainerEvent::ChildPropertyChanged {
            property: WatchedProperty::SizeHints,
            value: Variant::Array(Vec::new()),
        });
        events.emit(ContainerEvent::ChildPropertyChanged {
            property: WatchedProperty::Flags,
            value: Variant::UInt32(3),
        });

        assert_eq!(all.drain().len(), 3);
        assert_eq!(
            flags.drain(),
            vec![ContainerEvent::ChildPropertyChanged {
                property: WatchedProperty::Flags,
                value: Variant::UInt32(3),
            }]
        );
    }

    #[test]
    fn slow_subscribers_keep_every_event() {
        let events = EventBus::new(4);
        let mut slow = events.subscribe();

        events.emit(ContainerEvent::AppletLock { locked: true });
        for flags in 0..500 {
            events.emit(ContainerEvent::ChildPropertyChanged {
                property: WatchedProperty::Flags,
                value: Variant::UInt32(flags),
            });
        }
        events.emit(ContainerEvent::AppletRemove);
        assert_eq!(slow.backlog(), 502);

        let received = slow.drain();
        assert_eq!(received.len(), 502);
        assert_eq!(received.first(), Some(&ContainerEvent::AppletLock { locked: true }));
        assert_eq!(received.last(), Some(&ContainerEvent::AppletRemove));
        assert_eq!(slow.backlog(), 0);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let events = EventBus::new(8);
        let kept = events.subscribe();
        drop(events.subscribe());
        drop(events.subscribe_detail(WatchedProperty::SizeHints));

        events.emit(ContainerEvent::AppletMove);
        assert_eq!(events.subscribers.lock().len(), 1);
        assert_eq!(kept.backlog(), 1);

        let mut kept = kept;
        drop(events);
        assert_eq!(kept.recv().await, Some(ContainerEvent::AppletMove));
        assert_eq!(kept.recv().await, None);
    }

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let json = serde_json::to_value(ContainerEvent::AppletLock { locked: true }).expect("json");
        assert_eq!(json, serde_json::json!({ "event": "applet-lock", "locked": true }));

        let json = serde_json::to_value(ContainerEvent::ChildPropertyChanged {
            property: WatchedProperty::SizeHints,
            value: Variant::UInt32(1),
        })
        .expect("json");
        assert_eq!(json["property"], "size-hints");
        assert_eq!(json["event"], "child-property-changed");
    }
}
