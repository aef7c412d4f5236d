//! The container: owns at most one hosted applet session at a time.
//!
//! Teardown always runs in the same order: cancel pending operations,
//! drop the signal subscriptions, release the endpoint, release the embed
//! socket. Background tasks and window-system callbacks only hold weak
//! references plus the generation of the session they were created for,
//! so anything arriving for a session that is already gone is ignored.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use applet_bus::{Bus, Variant};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activation::{Activation, ActivationClient, ActivationRequest};
use crate::channel::{self, PropertyChannel};
use crate::config::HostConfig;
use crate::embedding::{
    DisplayBackend, EmbedState, Embedding, PlugRemovedHandler, Propagation,
};
use crate::endpoint::{BusHandle, MatchGuard, RemoteEndpoint};
use crate::error::{ContainerError, ContainerResult};
use crate::events::{ContainerEvent, EventBus, EventSubscription};
use crate::operations::{
    OperationHandle, OperationKind, OperationRegistry, PendingOperation, spawn_tracked,
};
use crate::protocol::{ComponentId, Namespace};
use crate::signals::{self, SignalPump, WatchedProperty};

#[derive(Debug)]
struct HostedSession {
    component: ComponentId,
    service: String,
    generation: u64,
    endpoint: Option<RemoteEndpoint>,
    link: Option<SignalLink>,
    embedding: Embedding,
}

/// Subscriptions and the tasks consuming them. Field order is drop order:
/// matches go first.
#[derive(Debug)]
struct SignalLink {
    matches: Vec<MatchGuard>,
    pumps: Vec<SignalPump>,
}

struct Inner {
    bus: BusHandle,
    display: Arc<dyn DisplayBackend>,
    namespace: Namespace,
    registry: Arc<OperationRegistry>,
    events: EventBus,
    session: Mutex<Option<HostedSession>>,
    generations: AtomicU64,
}

pub struct AppletContainer {
    inner: Arc<Inner>,
}

impl AppletContainer {
    pub fn new(bus: Arc<dyn Bus>, display: Arc<dyn DisplayBackend>, config: &HostConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: BusHandle::new(bus, config.call_timeout()),
                display,
                namespace: config.namespace(),
                registry: Arc::new(OperationRegistry::new()),
                events: EventBus::new(config.event_capacity),
                session: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Loads `iid` (`<factory-id>::<applet-id>`). Any applet already hosted
    /// is torn down first, without an `applet-broken` event.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add(
        &self,
        iid: &str,
        placement_hint: i32,
        params: Variant,
        token: &CancellationToken,
    ) -> ContainerResult<PendingOperation<()>> {
        let component = ComponentId::parse(iid)?;
        let inner = &self.inner;

        let previous = inner.session.lock().take();
        if let Some(previous) = previous {
            debug!(
                target = "applet.container",
                component = %previous.component,
                "replacing hosted applet"
            );
            inner.dismantle(previous);
        }

        let generation = inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let service = inner.namespace.service_name(component.factory_id());
        info!(target = "applet.container", %component, %service, generation, "loading applet");
        *inner.session.lock() = Some(HostedSession {
            component: component.clone(),
            service,
            generation,
            endpoint: None,
            link: None,
            embedding: Embedding::detached(),
        });

        let client = ActivationClient::new(inner.bus.clone(), inner.namespace.clone());
        let request = ActivationRequest {
            component,
            placement_hint,
            params,
        };
        let weak = Arc::downgrade(inner);
        Ok(spawn_tracked(
            &inner.registry,
            OperationKind::Activate,
            token,
            async move { client.activate(&request).await },
            move |activation| {
                let inner = weak.upgrade().ok_or(ContainerError::Cancelled)?;
                inner.install(generation, activation)
            },
        ))
    }

    pub fn get(&self, name: &str, token: &CancellationToken) -> ContainerResult<PendingOperation<Variant>> {
        let descriptor = channel::descriptor(name)?;
        let channel = self.inner.channel()?;
        Ok(self.inner.track(OperationKind::GetProperty, token, async move {
            channel.get(descriptor).await
        }))
    }

    pub fn set(
        &self,
        name: &str,
        value: Variant,
        token: &CancellationToken,
    ) -> ContainerResult<PendingOperation<()>> {
        let descriptor = channel::descriptor(name)?;
        let channel = self.inner.channel()?;
        Ok(self.inner.track(OperationKind::SetProperty, token, async move {
            channel.set(descriptor, value).await
        }))
    }

    /// Asks the applet to show its context menu.
    pub fn popup_menu(
        &self,
        button: u32,
        timestamp: u32,
        token: &CancellationToken,
    ) -> ContainerResult<PendingOperation<()>> {
        let channel = self.inner.channel()?;
        Ok(self.inner.track(OperationKind::PopupMenu, token, async move {
            channel.popup_menu(button, timestamp).await
        }))
    }

    pub fn cancel_operation(&self, handle: OperationHandle) -> bool {
        self.inner.registry.cancel(handle)
    }

    pub fn cancel_pending_operations(&self) -> usize {
        self.inner.registry.cancel_all()
    }

    /// Tears down the hosted applet, if any. No event is raised.
    pub fn remove(&self) -> bool {
        let session = self.inner.session.lock().take();
        match session {
            Some(session) => {
                info!(target = "applet.container", component = %session.component, "removing applet");
                self.inner.dismantle(session);
                true
            }
            None => false,
        }
    }

    /// Window-system notification that the embedded surface went away.
    pub fn handle_plug_removed(&self) -> Propagation {
        let generation = self.inner.session.lock().as_ref().map(|s| s.generation);
        if let Some(generation) = generation {
            self.inner.sever(generation, "embedded plug removed");
        }
        Propagation::Proceed
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    pub fn subscribe_detail(&self, property: WatchedProperty) -> EventSubscription {
        self.inner.events.subscribe_detail(property)
    }

    pub fn is_live(&self) -> bool {
        self.inner
            .session
            .lock()
            .as_ref()
            .is_some_and(|session| session.endpoint.is_some())
    }

    pub fn component_id(&self) -> Option<ComponentId> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.component.clone())
    }

    pub fn service_name(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.service.clone())
    }

    pub fn endpoint(&self) -> Option<RemoteEndpoint> {
        self.inner
            .session
            .lock()
            .as_ref()
            .and_then(|session| session.endpoint.clone())
    }

    pub fn embed_state(&self) -> EmbedState {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(EmbedState::Detached, |session| session.embedding.state())
    }

    pub fn pending_operations(&self) -> Vec<(OperationHandle, OperationKind)> {
        self.inner.registry.pending()
    }
}

impl Drop for AppletContainer {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for AppletContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppletContainer")
            .field("namespace", &self.inner.namespace)
            .field("session", &*self.inner.session.lock())
            .field("pending", &self.inner.registry.len())
            .finish()
    }
}

impl Inner {
    fn channel(&self) -> ContainerResult<PropertyChannel> {
        let endpoint = self
            .session
            .lock()
            .as_ref()
            .and_then(|session| session.endpoint.clone())
            .ok_or(ContainerError::NotReady)?;
        Ok(PropertyChannel::new(self.bus.clone(), endpoint))
    }

    fn track<T, W>(&self, kind: OperationKind, token: &CancellationToken, work: W) -> PendingOperation<T>
    where
        T: Send + 'static,
        W: std::future::Future<Output = ContainerResult<T>> + Send + 'static,
    {
        spawn_tracked(&self.registry, kind, token, work, Ok)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }

    fn install(self: &Arc<Self>, generation: u64, activation: Activation) -> ContainerResult<()> {
        if !self.is_current(generation) {
            return Err(ContainerError::Cancelled);
        }
        let Activation {
            endpoint,
            applet_signals,
            property_signals,
            mut owner_watch,
        } = activation;

        let embedding = Embedding::attach(
            self.display.as_ref(),
            &endpoint,
            self.plug_removed_handler(generation),
        );

        let (applet_match, applet_messages) = applet_signals.into_parts();
        let (property_match, property_messages) = property_signals.into_parts();
        let weak = Arc::downgrade(self);
        let link = SignalLink {
            matches: vec![applet_match, property_match],
            pumps: vec![
                SignalPump::spawn(applet_messages, self.events.clone(), |message| {
                    signals::applet_signal_event(message).into_iter().collect()
                }),
                SignalPump::spawn(property_messages, self.events.clone(), signals::property_events),
                SignalPump::watch(async move {
                    if owner_watch.vanished().await.is_ok() {
                        if let Some(inner) = weak.upgrade() {
                            inner.sever(generation, "applet owner left the bus");
                        }
                    }
                }),
            ],
        };

        let ready = ContainerEvent::Ready {
            instance_id: endpoint.instance_id,
            out_of_process: endpoint.out_of_process,
        };
        {
            let mut guard = self.session.lock();
            let Some(session) = guard
                .as_mut()
                .filter(|session| session.generation == generation)
            else {
                return Err(ContainerError::Cancelled);
            };
            info!(
                target = "applet.container",
                component = %session.component,
                embed_state = ?embedding.state(),
                "applet ready"
            );
            session.endpoint = Some(endpoint);
            session.link = Some(link);
            session.embedding = embedding;
        }
        self.events.emit(ready);
        Ok(())
    }

    fn plug_removed_handler(self: &Arc<Self>, generation: u64) -> PlugRemovedHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.sever(generation, "embedded plug removed");
            }
            Propagation::Proceed
        })
    }

    /// Drops a live session after its applet disappeared. Sessions that
    /// are not live, or not the one `generation` refers to, are left alone.
    fn sever(&self, generation: u64, reason: &str) -> bool {
        let session = {
            let mut guard = self.session.lock();
            let live = matches!(
                guard.as_ref(),
                Some(session) if session.generation == generation && session.endpoint.is_some()
            );
            if live { guard.take() } else { None }
        };
        let Some(session) = session else {
            debug!(target = "applet.container", generation, reason, "ignoring loss of inactive session");
            return false;
        };

        let component = session.component.clone();
        self.dismantle(session);
        warn!(
            target = "applet.container",
            %component,
            reason,
            error = %ContainerError::RemoteLost,
            "applet connection lost"
        );
        self.events.emit(ContainerEvent::AppletBroken);
        true
    }

    fn dismantle(&self, mut session: HostedSession) {
        let cancelled = self.registry.cancel_all();
        session.link = None;
        session.endpoint = None;
        session.embedding.detach();
        debug!(
            target = "applet.container",
            component = %session.component,
            cancelled,
            "applet session torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDisplay;
    use applet_bus::LocalBus;

    fn container(bus: &LocalBus) -> AppletContainer {
        AppletContainer::new(
            Arc::new(bus.clone()),
            Arc::new(MockDisplay::new()),
            &HostConfig::default(),
        )
    }

    #[test]
    fn malformed_identifier_fails_before_any_bus_traffic() {
        let bus = LocalBus::new();
        let container = container(&bus);
        let err = container
            .add("nofoo", 0, Variant::empty_dict(), &CancellationToken::new())
            .expect_err("invalid id");
        assert_eq!(err, ContainerError::InvalidIdentifier("nofoo".into()));
        assert!(bus.call_log().is_empty());
        assert_eq!(bus.active_watches(), 0);
        assert!(container.pending_operations().is_empty());
        assert!(container.component_id().is_none());
    }

    #[test]
    fn unknown_property_wins_over_not_ready() {
        let bus = LocalBus::new();
        let container = container(&bus);
        let token = CancellationToken::new();

        for name in ["colour", "Orientation-X", ""] {
            assert_eq!(
                container.get(name, &token).map(|_| ()),
                Err(ContainerError::UnknownProperty(name.to_string()))
            );
            assert_eq!(
                container
                    .set(name, Variant::UInt32(1), &token)
                    .map(|_| ()),
                Err(ContainerError::UnknownProperty(name.to_string()))
            );
        }
        assert!(container.pending_operations().is_empty());
        assert!(bus.call_log().is_empty());
    }

    #[test]
    fn known_property_without_endpoint_is_not_ready() {
        let bus = LocalBus::new();
        let container = container(&bus);
        let token = CancellationToken::new();
        assert_eq!(
            container.get("size", &token).map(|_| ()),
            Err(ContainerError::NotReady)
        );
        assert_eq!(
            container.popup_menu(3, 0, &token).map(|_| ()),
            Err(ContainerError::NotReady)
        );
        assert!(container.pending_operations().is_empty());
        assert_eq!(container.handle_plug_removed(), Propagation::Proceed);
        assert!(!container.remove());
    }
}
