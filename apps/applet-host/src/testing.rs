//! Stand-ins for the applet side and the display, used by the test suite
//! and by `applet-host simulate`.
//!
//! [`MockFactory`] installs an activatable factory service on a
//! [`LocalBus`]; every `GetApplet` exports a fresh [`MockApplet`] backed by
//! an in-memory property store. [`MockDisplay`] records the sockets it
//! hands out so tests can pull the plug on them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use applet_bus::{
    BusError, BusResult, LocalBus, LocalObject, MethodCall, ObjectContext, PROPERTIES_CHANGED,
    PROPERTIES_INTERFACE, SignalMessage, Variant, WeakLocalBus,
};
use parking_lot::Mutex;

use crate::embedding::{
    DisplayBackend, EmbedError, EmbedSocket, PlugRemovedHandler, Propagation,
};
use crate::properties;
use crate::protocol::{GET_APPLET, Namespace, POPUP_MENU};

#[derive(Debug, Clone, PartialEq)]
pub struct GetAppletRequest {
    pub applet_id: String,
    pub placement_hint: i32,
    pub params: Variant,
}

#[derive(Debug, Clone)]
struct FactoryConfig {
    object_path: String,
    out_of_process: bool,
    embed_handle: u32,
    instance_id: u32,
    reply_override: Option<Vec<Variant>>,
    claims_name: bool,
    properties: BTreeMap<String, Variant>,
}

#[derive(Default)]
struct FactoryState {
    bus: Option<WeakLocalBus>,
    owner: Option<String>,
    requests: Vec<GetAppletRequest>,
    applets: Vec<(String, String, Arc<AppletShared>)>,
}

struct FactoryShared {
    namespace: Namespace,
    factory_id: String,
    config: Mutex<FactoryConfig>,
    state: Mutex<FactoryState>,
}

/// Scripted applet factory. Cloning shares the same factory.
#[derive(Clone)]
pub struct MockFactory {
    shared: Arc<FactoryShared>,
}

pub fn default_properties() -> BTreeMap<String, Variant> {
    let mut store = BTreeMap::new();
    store.insert("PrefsPath".into(), Variant::from("/org/mate/panel/objects/clock/prefs/"));
    store.insert("Orient".into(), Variant::UInt32(0));
    store.insert("Size".into(), Variant::UInt32(24));
    store.insert("SizeHints".into(), Variant::Array(Vec::new()));
    store.insert("Background".into(), Variant::from("none:"));
    store.insert("Flags".into(), Variant::UInt32(0));
    store.insert("Locked".into(), Variant::Bool(false));
    store.insert("LockedDown".into(), Variant::Bool(false));
    store
}

impl MockFactory {
    /// An in-process factory replying `("/obj/1", false, 0, 1)`.
    pub fn new(namespace: &Namespace, factory_id: &str) -> Self {
        Self {
            shared: Arc::new(FactoryShared {
                namespace: namespace.clone(),
                factory_id: factory_id.to_string(),
                config: Mutex::new(FactoryConfig {
                    object_path: "/obj/1".into(),
                    out_of_process: false,
                    embed_handle: 0,
                    instance_id: 1,
                    reply_override: None,
                    claims_name: true,
                    properties: default_properties(),
                }),
                state: Mutex::new(FactoryState::default()),
            }),
        }
    }

    pub fn with_reply(
        self,
        object_path: &str,
        out_of_process: bool,
        embed_handle: u32,
        instance_id: u32,
    ) -> Self {
        {
            let mut config = self.shared.config.lock();
            config.object_path = object_path.to_string();
            config.out_of_process = out_of_process;
            config.embed_handle = embed_handle;
            config.instance_id = instance_id;
        }
        self
    }

    /// Replies to `GetApplet` with an arbitrary body.
    pub fn with_raw_reply(self, body: Vec<Variant>) -> Self {
        self.shared.config.lock().reply_override = Some(body);
        self
    }

    pub fn with_property(self, remote_name: &str, value: Variant) -> Self {
        self.shared
            .config
            .lock()
            .properties
            .insert(remote_name.to_string(), value);
        self
    }

    pub fn without_property(self, remote_name: &str) -> Self {
        self.shared.config.lock().properties.remove(remote_name);
        self
    }

    /// Starts but never claims its service name.
    pub fn failing_to_start(self) -> Self {
        self.shared.config.lock().claims_name = false;
        self
    }

    pub fn service_name(&self) -> String {
        self.shared.namespace.service_name(&self.shared.factory_id)
    }

    /// Registers the factory as activatable on `bus`; it starts on first use.
    pub fn install(&self, bus: &LocalBus) {
        self.shared.state.lock().bus = Some(bus.downgrade());
        let shared = self.shared.clone();
        bus.register_activatable(&self.service_name(), move |bus| {
            let unique = bus.connect();
            if !shared.config.lock().claims_name {
                return Ok(());
            }
            bus.request_name(&shared.namespace.service_name(&shared.factory_id), &unique)?;
            bus.export(
                &unique,
                &shared.namespace.factory_path(&shared.factory_id),
                Arc::new(FactoryObject {
                    shared: shared.clone(),
                }),
            );
            shared.state.lock().owner = Some(unique);
            Ok(())
        });
    }

    pub fn owner(&self) -> Option<String> {
        self.shared.state.lock().owner.clone()
    }

    pub fn requests(&self) -> Vec<GetAppletRequest> {
        self.shared.state.lock().requests.clone()
    }

    /// The most recently created applet.
    pub fn applet(&self) -> Option<MockAppletHandle> {
        let state = self.shared.state.lock();
        let bus = state.bus.as_ref()?.upgrade()?;
        let (owner, path, shared) = state.applets.last()?.clone();
        Some(MockAppletHandle {
            bus,
            owner,
            path,
            shared,
        })
    }

    /// Simulates the factory process dying: its connection leaves the bus.
    pub fn crash(&self) -> bool {
        let (bus, owner) = {
            let mut state = self.shared.state.lock();
            let bus = state.bus.as_ref().and_then(WeakLocalBus::upgrade);
            (bus, state.owner.take())
        };
        match (bus, owner) {
            (Some(bus), Some(owner)) => {
                bus.disconnect(&owner);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("service", &self.service_name())
            .field("owner", &self.owner())
            .finish()
    }
}

struct FactoryObject {
    shared: Arc<FactoryShared>,
}

impl LocalObject for FactoryObject {
    fn handle_call(&self, ctx: &ObjectContext<'_>, call: &MethodCall) -> BusResult<Vec<Variant>> {
        if call.interface != self.shared.namespace.factory_interface() || call.member != GET_APPLET
        {
            return Err(BusError::UnknownMethod {
                interface: call.interface.clone(),
                member: call.member.clone(),
            });
        }
        let request = match call.body.as_slice() {
            [Variant::Str(applet_id), Variant::Int32(placement_hint), params] => GetAppletRequest {
                applet_id: applet_id.clone(),
                placement_hint: *placement_hint,
                params: params.clone(),
            },
            _ => return Err(BusError::InvalidArgs("GetApplet expects (siv)".into())),
        };

        let config = self.shared.config.lock().clone();
        self.shared.state.lock().requests.push(request);
        if let Some(body) = config.reply_override {
            return Ok(body);
        }

        let applet = MockApplet::new(&self.shared.namespace.applet_interface(), config.properties);
        let shared = applet.shared.clone();
        ctx.bus()
            .export(ctx.owner(), &config.object_path, Arc::new(applet));
        self.shared.state.lock().applets.push((
            ctx.owner().to_string(),
            config.object_path.clone(),
            shared,
        ));

        Ok(vec![
            Variant::object_path(config.object_path),
            Variant::Bool(config.out_of_process),
            Variant::UInt32(config.embed_handle),
            Variant::UInt32(config.instance_id),
        ])
    }
}

struct AppletShared {
    interface: String,
    properties: Mutex<BTreeMap<String, Variant>>,
    writes: Mutex<Vec<(String, Variant)>>,
    popups: Mutex<Vec<(u32, u32)>>,
}

/// Applet instance object: the properties interface over an in-memory
/// store plus `PopupMenu`.
pub struct MockApplet {
    shared: Arc<AppletShared>,
}

impl MockApplet {
    pub fn new(interface: &str, properties: BTreeMap<String, Variant>) -> Self {
        Self {
            shared: Arc::new(AppletShared {
                interface: interface.to_string(),
                properties: Mutex::new(properties),
                writes: Mutex::new(Vec::new()),
                popups: Mutex::new(Vec::new()),
            }),
        }
    }

    fn property_call(&self, ctx: &ObjectContext<'_>, call: &MethodCall) -> BusResult<Vec<Variant>> {
        let interface = call.body.first().and_then(Variant::as_str);
        if interface != Some(self.shared.interface.as_str()) {
            return Err(BusError::InvalidArgs(format!(
                "no such interface {}",
                interface.unwrap_or("<missing>")
            )));
        }
        let name = call.body.get(1).and_then(Variant::as_str);

        match (call.member.as_str(), name) {
            ("Get", Some(name)) => self
                .shared
                .properties
                .lock()
                .get(name)
                .cloned()
                .map(|value| vec![value])
                .ok_or_else(|| BusError::UnknownProperty(name.to_string())),
            ("GetAll", _) => Ok(vec![Variant::Dict(self.shared.properties.lock().clone())]),
            ("Set", Some(name)) => {
                let descriptor = properties::by_remote_name(name)
                    .ok_or_else(|| BusError::UnknownProperty(name.to_string()))?;
                let value = call
                    .body
                    .get(2)
                    .cloned()
                    .ok_or_else(|| BusError::InvalidArgs("Set expects (ssv)".into()))?;
                if !descriptor.kind.accepts(&value) {
                    return Err(BusError::InvalidArgs(format!(
                        "{name} expects type {}, got {}",
                        descriptor.kind.signature(),
                        value.signature()
                    )));
                }
                self.shared
                    .properties
                    .lock()
                    .insert(name.to_string(), value.clone());
                self.shared.writes.lock().push((name.to_string(), value.clone()));
                ctx.emit(
                    PROPERTIES_INTERFACE,
                    PROPERTIES_CHANGED,
                    properties_changed_body(&self.shared.interface, [(name.to_string(), value)]),
                );
                Ok(Vec::new())
            }
            _ => Err(BusError::UnknownMethod {
                interface: call.interface.clone(),
                member: call.member.clone(),
            }),
        }
    }
}

impl LocalObject for MockApplet {
    fn handle_call(&self, ctx: &ObjectContext<'_>, call: &MethodCall) -> BusResult<Vec<Variant>> {
        if call.interface == PROPERTIES_INTERFACE {
            return self.property_call(ctx, call);
        }
        match (call.interface == self.shared.interface, call.member.as_str(), call.body.as_slice()) {
            (true, POPUP_MENU, [Variant::UInt32(button), Variant::UInt32(timestamp)]) => {
                self.shared.popups.lock().push((*button, *timestamp));
                Ok(Vec::new())
            }
            (true, POPUP_MENU, _) => Err(BusError::InvalidArgs("PopupMenu expects (uu)".into())),
            _ => Err(BusError::UnknownMethod {
                interface: call.interface.clone(),
                member: call.member.clone(),
            }),
        }
    }
}

fn properties_changed_body(
    interface: &str,
    changes: impl IntoIterator<Item = (String, Variant)>,
) -> Vec<Variant> {
    vec![
        Variant::from(interface),
        Variant::Dict(changes.into_iter().collect()),
        Variant::Array(Vec::new()),
    ]
}

/// Test-side view of a live [`MockApplet`]: raise its signals, inspect its
/// store.
#[derive(Clone)]
pub struct MockAppletHandle {
    bus: LocalBus,
    owner: String,
    path: String,
    shared: Arc<AppletShared>,
}

impl MockAppletHandle {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn object_path(&self) -> &str {
        &self.path
    }

    /// Emits a bare signal (`Move`, `Lock`, ...) on the applet interface.
    pub fn emit(&self, member: &str) {
        self.bus.emit_signal(SignalMessage {
            sender: self.owner.clone(),
            path: self.path.clone(),
            interface: self.shared.interface.clone(),
            member: member.to_string(),
            body: Vec::new(),
        });
    }

    /// Updates the store the way the applet itself would and announces it.
    pub fn change_properties(&self, changes: &[(&str, Variant)]) {
        {
            let mut store = self.shared.properties.lock();
            for (name, value) in changes {
                store.insert((*name).to_string(), value.clone());
            }
        }
        self.bus.emit_signal(SignalMessage {
            sender: self.owner.clone(),
            path: self.path.clone(),
            interface: PROPERTIES_INTERFACE.to_string(),
            member: PROPERTIES_CHANGED.to_string(),
            body: properties_changed_body(
                &self.shared.interface,
                changes
                    .iter()
                    .map(|(name, value)| ((*name).to_string(), value.clone())),
            ),
        });
    }

    pub fn property(&self, remote_name: &str) -> Option<Variant> {
        self.shared.properties.lock().get(remote_name).cloned()
    }

    /// Every `Set` the applet applied, in order.
    pub fn writes(&self) -> Vec<(String, Variant)> {
        self.shared.writes.lock().clone()
    }

    pub fn popup_requests(&self) -> Vec<(u32, u32)> {
        self.shared.popups.lock().clone()
    }
}

impl fmt::Debug for MockAppletHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockAppletHandle")
            .field("owner", &self.owner)
            .field("path", &self.path)
            .finish()
    }
}

/// Recording display backend.
#[derive(Clone, Debug)]
pub struct MockDisplay {
    supports_sockets: bool,
    fail_embeds: bool,
    sockets: Arc<Mutex<Vec<MockSocket>>>,
    in_process: Arc<Mutex<Vec<u32>>>,
}

impl Default for MockDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDisplay {
    pub fn new() -> Self {
        Self {
            supports_sockets: true,
            fail_embeds: false,
            sockets: Arc::default(),
            in_process: Arc::default(),
        }
    }

    /// A display like Wayland: no socket embedding.
    pub fn without_sockets() -> Self {
        Self {
            supports_sockets: false,
            ..Self::new()
        }
    }

    pub fn failing_embeds(mut self) -> Self {
        self.fail_embeds = true;
        self
    }

    pub fn sockets(&self) -> Vec<MockSocket> {
        self.sockets.lock().clone()
    }

    pub fn last_socket(&self) -> Option<MockSocket> {
        self.sockets.lock().last().cloned()
    }

    pub fn in_process_attachments(&self) -> Vec<u32> {
        self.in_process.lock().clone()
    }
}

impl DisplayBackend for MockDisplay {
    fn supports_sockets(&self) -> bool {
        self.supports_sockets
    }

    fn create_socket(&self) -> Result<Box<dyn EmbedSocket>, EmbedError> {
        if !self.supports_sockets {
            return Err(EmbedError::Unsupported);
        }
        let socket = MockSocket::default();
        self.sockets.lock().push(socket.clone());
        Ok(Box::new(OwnedSocket {
            socket,
            fail_embeds: self.fail_embeds,
        }))
    }

    fn attach_in_process(&self, instance_id: u32) -> Result<(), EmbedError> {
        self.in_process.lock().push(instance_id);
        Ok(())
    }
}

#[derive(Default)]
struct SocketState {
    embedded: Option<u32>,
    handler: Option<PlugRemovedHandler>,
    destroyed: bool,
}

/// Observer for one socket handed out by [`MockDisplay`].
#[derive(Clone, Default)]
pub struct MockSocket {
    state: Arc<Mutex<SocketState>>,
}

impl MockSocket {
    pub fn embedded_handle(&self) -> Option<u32> {
        self.state.lock().embedded
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Fires plug-removed the way the window system would when the remote
    /// surface disappears. `None` if nothing is listening any more.
    pub fn remove_plug(&self) -> Option<Propagation> {
        let handler = {
            let mut state = self.state.lock();
            state.embedded = None;
            state.handler.clone()
        };
        handler.map(|handler| handler())
    }
}

impl fmt::Debug for MockSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockSocket")
            .field("embedded", &state.embedded)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// The container's end of a [`MockSocket`]; dropping it destroys the socket.
struct OwnedSocket {
    socket: MockSocket,
    fail_embeds: bool,
}

impl EmbedSocket for OwnedSocket {
    fn on_plug_removed(&mut self, handler: PlugRemovedHandler) {
        self.socket.state.lock().handler = Some(handler);
    }

    fn add_id(&mut self, handle: u32) -> Result<(), EmbedError> {
        if self.fail_embeds {
            return Err(EmbedError::Failed(format!("window {handle:#x} is gone")));
        }
        self.socket.state.lock().embedded = Some(handle);
        Ok(())
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        let mut state = self.socket.state.lock();
        state.destroyed = true;
        state.embedded = None;
        state.handler = None;
    }
}
