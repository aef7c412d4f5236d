use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::{
    Bus, BusError, BusResult, MatchId, MatchRule, MethodCall, NameWatch, SignalMessage,
    SignalSubscription, Variant, WatchFlags, PEER_INTERFACE,
};

/// An object exported on a [`LocalBus`] by one of its connections.
pub trait LocalObject: Send + Sync {
    fn handle_call(&self, ctx: &ObjectContext<'_>, call: &MethodCall)
        -> BusResult<Vec<Variant>>;
}

/// Where a call landed; lets objects emit signals as their owner.
pub struct ObjectContext<'a> {
    bus: &'a LocalBus,
    owner: &'a str,
    path: &'a str,
}

impl<'a> ObjectContext<'a> {
    pub fn bus(&self) -> &LocalBus {
        self.bus
    }

    pub fn owner(&self) -> &str {
        self.owner
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn emit(&self, interface: &str, member: &str, body: Vec<Variant>) {
        self.bus.emit_signal(SignalMessage {
            sender: self.owner.to_string(),
            path: self.path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            body,
        });
    }
}

/// Starts the service behind a well-known name. Runs when a name is
/// needed and has no owner, the way a bus daemon spawns from a service file.
pub type Activator = Arc<dyn Fn(&LocalBus) -> BusResult<()> + Send + Sync>;

/// Simple in-memory bus for tests and non-transport contexts.
#[derive(Clone)]
pub struct LocalBus {
    shared: Arc<Shared>,
}

/// Non-owning handle to a [`LocalBus`], for services that live on the bus
/// and must not keep it alive.
#[derive(Clone)]
pub struct WeakLocalBus {
    shared: Weak<Shared>,
}

impl WeakLocalBus {
    pub fn upgrade(&self) -> Option<LocalBus> {
        self.shared.upgrade().map(|shared| LocalBus { shared })
    }
}

struct Shared {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    connections: HashSet<String>,
    names: HashMap<String, watch::Sender<Option<String>>>,
    activators: HashMap<String, Activator>,
    activations: HashMap<String, usize>,
    objects: HashMap<(String, String), Arc<dyn LocalObject>>,
    watches: HashMap<u64, String>,
    matches: HashMap<MatchId, (MatchRule, mpsc::UnboundedSender<SignalMessage>)>,
    calls: Vec<MethodCall>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn name_sender(&mut self, name: &str) -> &watch::Sender<Option<String>> {
        self.names
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0)
    }

    fn owner_of(&self, name: &str) -> Option<String> {
        self.names.get(name).and_then(|tx| tx.borrow().clone())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                gate,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakLocalBus {
        WeakLocalBus {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Opens a new connection and returns its unique name.
    pub fn connect(&self) -> String {
        let mut state = self.shared.state.lock();
        let unique = format!(":1.{}", state.next_id());
        state.connections.insert(unique.clone());
        unique
    }

    /// Drops a connection as if its process exited: every name it owned
    /// loses its owner and its objects disappear.
    pub fn disconnect(&self, unique: &str) {
        let mut state = self.shared.state.lock();
        state.connections.remove(unique);
        for tx in state.names.values() {
            let owned = tx.borrow().as_deref() == Some(unique);
            if owned {
                tx.send_replace(None);
            }
        }
        state.objects.retain(|(owner, _), _| owner != unique);
        debug!(target = "applet.bus", unique, "connection dropped");
    }

    pub fn request_name(&self, name: &str, unique: &str) -> BusResult<()> {
        let mut state = self.shared.state.lock();
        if let Some(current) = state.owner_of(name) {
            if current != unique {
                return Err(BusError::Transport(format!(
                    "{name} is already owned by {current}"
                )));
            }
        }
        state.name_sender(name).send_replace(Some(unique.to_string()));
        Ok(())
    }

    pub fn release_name(&self, name: &str) {
        let state = self.shared.state.lock();
        if let Some(tx) = state.names.get(name) {
            tx.send_replace(None);
        }
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        self.shared.state.lock().owner_of(name)
    }

    pub fn register_activatable<F>(&self, name: &str, activator: F)
    where
        F: Fn(&LocalBus) -> BusResult<()> + Send + Sync + 'static,
    {
        self.shared
            .state
            .lock()
            .activators
            .insert(name.to_string(), Arc::new(activator));
    }

    pub fn export(&self, unique: &str, path: &str, object: Arc<dyn LocalObject>) {
        self.shared
            .state
            .lock()
            .objects
            .insert((unique.to_string(), path.to_string()), object);
    }

    pub fn unexport(&self, unique: &str, path: &str) {
        self.shared
            .state
            .lock()
            .objects
            .remove(&(unique.to_string(), path.to_string()));
    }

    /// Delivers a signal to every subscription whose rule matches it.
    pub fn emit_signal(&self, message: SignalMessage) {
        let mut state = self.shared.state.lock();
        state.matches.retain(|_, (rule, tx)| {
            if rule.matches(&message) {
                tx.send(message.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }

    /// Parks every call made from now on until [`release_replies`] runs.
    ///
    /// [`release_replies`]: LocalBus::release_replies
    pub fn hold_replies(&self) {
        self.shared.gate.send_replace(true);
    }

    pub fn release_replies(&self) {
        self.shared.gate.send_replace(false);
    }

    pub fn call_log(&self) -> Vec<MethodCall> {
        self.shared.state.lock().calls.clone()
    }

    pub fn call_count(&self, member: &str) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|call| call.member == member)
            .count()
    }

    pub fn active_watches(&self) -> usize {
        self.shared.state.lock().watches.len()
    }

    pub fn active_matches(&self) -> usize {
        self.shared.state.lock().matches.len()
    }

    pub fn activation_count(&self, name: &str) -> usize {
        self.shared
            .state
            .lock()
            .activations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn activate(&self, name: &str) -> BusResult<String> {
        let activator = {
            let state = self.shared.state.lock();
            if let Some(owner) = state.owner_of(name) {
                return Ok(owner);
            }
            state.activators.get(name).cloned()
        };
        let activator = activator.ok_or_else(|| BusError::ServiceUnknown(name.to_string()))?;

        debug!(target = "applet.bus", name, "activating service");
        activator(self)?;

        let mut state = self.shared.state.lock();
        *state.activations.entry(name.to_string()).or_default() += 1;
        state.owner_of(name).ok_or_else(|| BusError::SpawnFailed {
            name: name.to_string(),
            reason: "service did not claim its name".into(),
        })
    }

    fn resolve(&self, call: &MethodCall) -> BusResult<String> {
        if call.destination.starts_with(':') {
            let connected = self
                .shared
                .state
                .lock()
                .connections
                .contains(&call.destination);
            return if connected {
                Ok(call.destination.clone())
            } else {
                Err(BusError::ServiceUnknown(call.destination.clone()))
            };
        }
        if let Some(owner) = self.owner(&call.destination) {
            return Ok(owner);
        }
        if call.flags.no_auto_start {
            return Err(BusError::ServiceUnknown(call.destination.clone()));
        }
        self.activate(&call.destination)
    }

    async fn wait_for_gate(&self) {
        let mut gate = self.shared.gate.subscribe();
        loop {
            let held = *gate.borrow_and_update();
            if !held {
                return;
            }
            if gate.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn watch_name(&self, name: &str, flags: WatchFlags) -> Box<dyn NameWatch> {
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        state.watches.insert(id, name.to_string());
        let owner = state.name_sender(name).subscribe();
        Box::new(LocalNameWatch {
            id,
            name: name.to_string(),
            flags,
            owner,
            start_attempted: false,
            shared: Arc::downgrade(&self.shared),
        })
    }

    async fn call(&self, call: MethodCall) -> BusResult<Vec<Variant>> {
        self.shared.state.lock().calls.push(call.clone());
        self.wait_for_gate().await;

        let owner = self.resolve(&call)?;
        let object = self
            .shared
            .state
            .lock()
            .objects
            .get(&(owner.clone(), call.path.clone()))
            .cloned();
        let Some(object) = object else {
            return Err(BusError::UnknownObject {
                destination: call.destination.clone(),
                path: call.path.clone(),
            });
        };

        if call.interface == PEER_INTERFACE {
            return match call.member.as_str() {
                "Ping" => Ok(Vec::new()),
                _ => Err(BusError::UnknownMethod {
                    interface: call.interface.clone(),
                    member: call.member.clone(),
                }),
            };
        }

        trace!(
            target = "applet.bus",
            destination = %owner,
            path = %call.path,
            member = %call.member,
            "dispatching call"
        );
        let ctx = ObjectContext {
            bus: self,
            owner: &owner,
            path: &call.path,
        };
        object.handle_call(&ctx, &call)
    }

    fn add_match(&self, rule: MatchRule) -> BusResult<SignalSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        let id = MatchId(state.next_id());
        state.matches.insert(id, (rule, tx));
        Ok(SignalSubscription { id, messages: rx })
    }

    fn remove_match(&self, id: MatchId) {
        self.shared.state.lock().matches.remove(&id);
    }
}

struct LocalNameWatch {
    id: u64,
    name: String,
    flags: WatchFlags,
    owner: watch::Receiver<Option<String>>,
    start_attempted: bool,
    shared: Weak<Shared>,
}

impl LocalNameWatch {
    fn bus(&self) -> BusResult<LocalBus> {
        self.shared
            .upgrade()
            .map(|shared| LocalBus { shared })
            .ok_or(BusError::Closed)
    }
}

#[async_trait]
impl NameWatch for LocalNameWatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn appeared(&mut self) -> BusResult<String> {
        loop {
            let current = self.owner.borrow_and_update().clone();
            if let Some(owner) = current {
                return Ok(owner);
            }
            if self.flags.auto_start && !self.start_attempted {
                self.start_attempted = true;
                self.bus()?.activate(&self.name)?;
                continue;
            }
            self.owner.changed().await.map_err(|_| BusError::Closed)?;
        }
    }

    async fn vanished(&mut self) -> BusResult<()> {
        loop {
            let owned = self.owner.borrow_and_update().is_some();
            if !owned {
                return Ok(());
            }
            self.owner.changed().await.map_err(|_| BusError::Closed)?;
        }
    }
}

impl Drop for LocalNameWatch {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().watches.remove(&self.id);
        }
    }
}
