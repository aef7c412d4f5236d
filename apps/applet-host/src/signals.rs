//! Translating applet signals into container events.

use applet_bus::{SignalMessage, Variant};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::events::{ContainerEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSignal {
    Move,
    RemoveFromPanel,
    Lock,
    Unlock,
    Unrecognized,
}

impl RemoteSignal {
    pub fn from_member(member: &str) -> Self {
        match member {
            "Move" => RemoteSignal::Move,
            "RemoveFromPanel" => RemoteSignal::RemoveFromPanel,
            "Lock" => RemoteSignal::Lock,
            "Unlock" => RemoteSignal::Unlock,
            _ => RemoteSignal::Unrecognized,
        }
    }

    pub fn into_event(self) -> Option<ContainerEvent> {
        match self {
            RemoteSignal::Move => Some(ContainerEvent::AppletMove),
            RemoteSignal::RemoveFromPanel => Some(ContainerEvent::AppletRemove),
            RemoteSignal::Lock => Some(ContainerEvent::AppletLock { locked: true }),
            RemoteSignal::Unlock => Some(ContainerEvent::AppletLock { locked: false }),
            RemoteSignal::Unrecognized => None,
        }
    }
}

/// The two applet properties whose changes the container forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchedProperty {
    Flags,
    SizeHints,
}

impl WatchedProperty {
    pub fn from_remote(key: &str) -> Option<Self> {
        match key {
            "Flags" => Some(WatchedProperty::Flags),
            "SizeHints" => Some(WatchedProperty::SizeHints),
            _ => None,
        }
    }

    pub fn local_name(self) -> &'static str {
        match self {
            WatchedProperty::Flags => "flags",
            WatchedProperty::SizeHints => "size-hints",
        }
    }

    pub fn remote_name(self) -> &'static str {
        match self {
            WatchedProperty::Flags => "Flags",
            WatchedProperty::SizeHints => "SizeHints",
        }
    }
}

pub fn applet_signal_event(message: &SignalMessage) -> Option<ContainerEvent> {
    let event = RemoteSignal::from_member(&message.member).into_event();
    if event.is_none() {
        trace!(target = "applet.signals", member = %message.member, "ignoring applet signal");
    }
    event
}

/// `PropertiesChanged(s interface, a{sv} changed, as invalidated)`;
/// only watched keys survive.
pub fn property_events(message: &SignalMessage) -> Vec<ContainerEvent> {
    let Some(changed) = message.body.get(1).and_then(Variant::as_dict) else {
        debug!(target = "applet.signals", "PropertiesChanged without a change set");
        return Vec::new();
    };
    changed
        .iter()
        .filter_map(|(key, value)| {
            WatchedProperty::from_remote(key).map(|property| ContainerEvent::ChildPropertyChanged {
                property,
                value: value.clone(),
            })
        })
        .collect()
}

/// Background task forwarding one signal stream into the event bus.
/// Aborted when dropped.
#[derive(Debug)]
pub(crate) struct SignalPump {
    task: JoinHandle<()>,
}

impl SignalPump {
    pub(crate) fn spawn<F>(
        mut messages: mpsc::UnboundedReceiver<SignalMessage>,
        events: EventBus,
        translate: F,
    ) -> Self
    where
        F: Fn(&SignalMessage) -> Vec<ContainerEvent> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                for event in translate(&message) {
                    events.emit(event);
                }
            }
            trace!(target = "applet.signals", "signal stream closed");
        });
        Self { task }
    }

    pub(crate) fn watch<F>(task: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(task),
        }
    }
}

impl Drop for SignalPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn message(member: &str, body: Vec<Variant>) -> SignalMessage {
        SignalMessage {
            sender: ":1.1".into(),
            path: "/obj/1".into(),
            interface: "org.mate.panel.applet.Applet".into(),
            member: member.into(),
            body,
        }
    }

    #[test]
    fn maps_exactly_four_signals() {
        assert_eq!(
            applet_signal_event(&message("Move", Vec::new())),
            Some(ContainerEvent::AppletMove)
        );
        assert_eq!(
            applet_signal_event(&message("RemoveFromPanel", Vec::new())),
            Some(ContainerEvent::AppletRemove)
        );
        assert_eq!(
            applet_signal_event(&message("Lock", Vec::new())),
            Some(ContainerEvent::AppletLock { locked: true })
        );
        assert_eq!(
            applet_signal_event(&message("Unlock", Vec::new())),
            Some(ContainerEvent::AppletLock { locked: false })
        );
        assert_eq!(applet_signal_event(&message("move", Vec::new())), None);
        assert_eq!(applet_signal_event(&message("Resize", Vec::new())), None);
    }

    #[test]
    fn property_changes_filter_to_watched_keys() {
        let mut changed = BTreeMap::new();
        changed.insert("Flags".to_string(), Variant::UInt32(5));
        changed.insert("Size".to_string(), Variant::UInt32(48));
        changed.insert(
            "SizeHints".to_string(),
            Variant::Array(vec![Variant::Int32(10), Variant::Int32(0)]),
        );
        let signal = message(
            "PropertiesChanged",
            vec![
                Variant::from("org.mate.panel.applet.Applet"),
                Variant::Dict(changed),
                Variant::Array(Vec::new()),
            ],
        );

        let events = property_events(&signal);
        assert_eq!(events.len(), 2);
        assert!(events.contains(&ContainerEvent::ChildPropertyChanged {
            property: WatchedProperty::Flags,
            value: Variant::UInt32(5),
        }));
        assert!(events.iter().all(|event| event.detail().is_some()));
    }

    #[test]
    fn malformed_property_changes_are_ignored() {
        let signal = message("PropertiesChanged", vec![Variant::from("iface")]);
        assert!(property_events(&signal).is_empty());
    }

    #[tokio::test]
    async fn pump_forwards_until_dropped() {
        let events = EventBus::new(8);
        let mut sub = events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = SignalPump::spawn(rx, events.clone(), |message| {
            applet_signal_event(message).into_iter().collect()
        });

        tx.send(message("Lock", Vec::new())).expect("send");
        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event in time");
        assert_eq!(event, Some(ContainerEvent::AppletLock { locked: true }));

        drop(pump);
        tokio::task::yield_now().await;
        let _ = tx.send(message("Move", Vec::new()));
        tokio::task::yield_now().await;
        assert_eq!(sub.try_recv(), None);
    }
}
