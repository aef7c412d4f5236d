//! [`Bus`] over a real session-bus connection.
//!
//! Calls are sent as raw method-call messages so the no-auto-start flag can
//! be set per call; replies are picked off the connection's message stream
//! by serial. Name watches follow `NameOwnerChanged` filtered on `arg0`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use zbus::fdo::DBusProxy;
use zbus::message::{Flags, Type as MessageType};
use zbus::names::{BusName, WellKnownName};
use zbus::zvariant::{Array, Dict, ObjectPath, Signature, Structure, StructureBuilder, Value};
use zbus::{Connection, Message, MessageStream};

use crate::{
    Bus, BusError, BusResult, MatchId, MatchRule, MethodCall, NameWatch, SignalMessage,
    SignalSubscription, Variant, WatchFlags,
};

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

fn transport(err: impl fmt::Display) -> BusError {
    BusError::Transport(err.to_string())
}

fn invalid(err: impl fmt::Display) -> BusError {
    BusError::InvalidArgs(err.to_string())
}

/// A connection to the user's session bus.
pub struct SessionBus {
    connection: Connection,
    dbus: DBusProxy<'static>,
    matches: Mutex<HashMap<MatchId, JoinHandle<()>>>,
    next_match: AtomicU64,
}

impl SessionBus {
    /// Connects to the bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub async fn connect() -> BusResult<Self> {
        let connection = Connection::session().await.map_err(transport)?;
        Self::with_connection(connection).await
    }

    pub async fn with_connection(connection: Connection) -> BusResult<Self> {
        let dbus = DBusProxy::new(&connection).await.map_err(transport)?;
        debug!(
            target = "applet.bus",
            unique_name = ?connection.unique_name().map(ToString::to_string),
            "connected to session bus"
        );
        Ok(Self {
            connection,
            dbus,
            matches: Mutex::new(HashMap::new()),
            next_match: AtomicU64::new(1),
        })
    }

    pub fn unique_name(&self) -> Option<String> {
        self.connection.unique_name().map(ToString::to_string)
    }
}

impl fmt::Debug for SessionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBus")
            .field("unique_name", &self.unique_name())
            .field("matches", &self.matches.lock().len())
            .finish()
    }
}

impl Drop for SessionBus {
    fn drop(&mut self) {
        for (_, task) in self.matches.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl Bus for SessionBus {
    fn watch_name(&self, name: &str, flags: WatchFlags) -> Box<dyn NameWatch> {
        Box::new(SessionNameWatch {
            name: name.to_string(),
            flags,
            connection: self.connection.clone(),
            dbus: self.dbus.clone(),
            changes: None,
            start_attempted: false,
        })
    }

    async fn call(&self, call: MethodCall) -> BusResult<Vec<Variant>> {
        let message = method_message(&call)?;
        let serial = message.primary_header().serial_num();
        // Subscribe before sending so the reply cannot slip past.
        let mut replies = MessageStream::from(&self.connection);
        trace!(
            target = "applet.bus",
            destination = %call.destination,
            path = %call.path,
            member = %call.member,
            no_auto_start = call.flags.no_auto_start,
            "sending method call"
        );
        self.connection.send(&message).await.map_err(transport)?;

        while let Some(reply) = replies.next().await {
            let reply = reply.map_err(transport)?;
            if reply.header().reply_serial() != Some(serial) {
                continue;
            }
            match reply.message_type() {
                MessageType::MethodReturn => return body_of(&reply),
                MessageType::Error => return Err(error_reply(&call, &reply)),
                _ => {}
            }
        }
        Err(BusError::Closed)
    }

    /// The rule is installed on the bus asynchronously; signals sent before
    /// the bus has acknowledged it are not delivered.
    fn add_match(&self, rule: MatchRule) -> BusResult<SignalSubscription> {
        let text = signal_rule(&rule);
        zbus::MatchRule::try_from(text.as_str()).map_err(invalid)?;

        let id = MatchId(self.next_match.fetch_add(1, Ordering::Relaxed));
        let (tx, messages) = mpsc::unbounded_channel();
        let connection = self.connection.clone();
        let task = tokio::spawn(async move {
            let mut stream = match subscribe(&connection, &text).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target = "applet.bus", rule = %text, error = %err, "failed to install match rule");
                    return;
                }
            };
            while let Some(message) = stream.next().await {
                let signal = match message.map_err(transport).and_then(|m| signal_from(&m)) {
                    Ok(signal) => signal,
                    Err(err) => {
                        debug!(target = "applet.bus", error = %err, "dropping undecodable signal");
                        continue;
                    }
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });
        self.matches.lock().insert(id, task);
        debug!(target = "applet.bus", id = id.0, %rule, "match added");
        Ok(SignalSubscription { id, messages })
    }

    fn remove_match(&self, id: MatchId) {
        if let Some(task) = self.matches.lock().remove(&id) {
            task.abort();
            debug!(target = "applet.bus", id = id.0, "match removed");
        }
    }
}

struct SessionNameWatch {
    name: String,
    flags: WatchFlags,
    connection: Connection,
    dbus: DBusProxy<'static>,
    changes: Option<MessageStream>,
    start_attempted: bool,
}

impl SessionNameWatch {
    async fn changes(&mut self) -> BusResult<&mut MessageStream> {
        if self.changes.is_none() {
            let rule = MatchRule::new()
                .sender(DBUS_NAME)
                .path(DBUS_PATH)
                .interface(DBUS_NAME)
                .member("NameOwnerChanged")
                .arg0(self.name.as_str());
            self.changes = Some(subscribe(&self.connection, &signal_rule(&rule)).await?);
        }
        self.changes.as_mut().ok_or(BusError::Closed)
    }

    /// Waits for the next ownership change; `None` means the name was released.
    async fn next_change(&mut self) -> BusResult<Option<String>> {
        let changes = self.changes().await?;
        while let Some(message) = changes.next().await {
            let message = message.map_err(transport)?;
            let Ok((_, _, new_owner)) = message.body().deserialize::<(String, String, String)>()
            else {
                continue;
            };
            return Ok(Some(new_owner).filter(|owner| !owner.is_empty()));
        }
        Err(BusError::Closed)
    }

    async fn current_owner(&self) -> BusResult<Option<String>> {
        let name = BusName::try_from(self.name.as_str()).map_err(invalid)?;
        match self.dbus.get_name_owner(name).await {
            Ok(owner) => Ok(Some(owner.to_string())),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => Ok(None),
            Err(err) => Err(transport(err)),
        }
    }

    async fn start_service(&self) -> BusResult<()> {
        let name = WellKnownName::try_from(self.name.as_str()).map_err(invalid)?;
        debug!(target = "applet.bus", name = %self.name, "requesting service activation");
        match self.dbus.start_service_by_name(name, 0).await {
            Ok(_) => Ok(()),
            Err(zbus::fdo::Error::ServiceUnknown(_)) => {
                Err(BusError::ServiceUnknown(self.name.clone()))
            }
            Err(err) => Err(BusError::SpawnFailed {
                name: self.name.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl NameWatch for SessionNameWatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn appeared(&mut self) -> BusResult<String> {
        // Owner changes are captured before the first query so none is missed.
        self.changes().await?;
        loop {
            if let Some(owner) = self.current_owner().await? {
                return Ok(owner);
            }
            if self.flags.auto_start && !self.start_attempted {
                self.start_attempted = true;
                self.start_service().await?;
                continue;
            }
            if let Some(owner) = self.next_change().await? {
                return Ok(owner);
            }
        }
    }

    async fn vanished(&mut self) -> BusResult<()> {
        self.changes().await?;
        if self.current_owner().await?.is_none() {
            return Ok(());
        }
        while self.next_change().await?.is_some() {}
        Ok(())
    }
}

fn signal_rule(rule: &MatchRule) -> String {
    let rest = rule.to_string();
    if rest.is_empty() {
        "type='signal'".to_string()
    } else {
        format!("type='signal',{rest}")
    }
}

async fn subscribe(connection: &Connection, rule: &str) -> BusResult<MessageStream> {
    let rule = zbus::MatchRule::try_from(rule).map_err(invalid)?;
    MessageStream::for_match_rule(rule, connection, None)
        .await
        .map_err(transport)
}

fn method_message(call: &MethodCall) -> BusResult<Message> {
    let mut builder = Message::method(call.path.as_str(), call.member.as_str())
        .map_err(invalid)?
        .destination(call.destination.as_str())
        .map_err(invalid)?
        .interface(call.interface.as_str())
        .map_err(invalid)?;
    if call.flags.no_auto_start {
        builder = builder.with_flags(Flags::NoAutoStart).map_err(invalid)?;
    }
    match body_structure(&call.body)? {
        Some(body) => builder.build(&body),
        None => builder.build(&()),
    }
    .map_err(transport)
}

fn signal_from(message: &Message) -> BusResult<SignalMessage> {
    let header = message.header();
    Ok(SignalMessage {
        sender: header.sender().map(ToString::to_string).unwrap_or_default(),
        path: header.path().map(ToString::to_string).unwrap_or_default(),
        interface: header.interface().map(ToString::to_string).unwrap_or_default(),
        member: header.member().map(ToString::to_string).unwrap_or_default(),
        body: body_of(message)?,
    })
}

fn error_reply(call: &MethodCall, reply: &Message) -> BusError {
    let name = reply
        .header()
        .error_name()
        .map(ToString::to_string)
        .unwrap_or_default();
    let message = reply.body().deserialize::<String>().unwrap_or_default();
    BusError::from_error_reply(call, &name, message)
}

fn body_of(message: &Message) -> BusResult<Vec<Variant>> {
    let empty = message
        .header()
        .signature()
        .map_or(true, |signature| signature.as_str().is_empty());
    if empty {
        return Ok(Vec::new());
    }
    let body = message.body();
    let fields: Structure<'_> = body.deserialize().map_err(invalid)?;
    fields.fields().iter().map(from_value).collect()
}

fn body_structure(items: &[Variant]) -> BusResult<Option<Structure<'static>>> {
    if items.is_empty() {
        return Ok(None);
    }
    let mut builder = StructureBuilder::new();
    for item in items {
        builder = builder.append_field(to_value(item)?);
    }
    Ok(Some(builder.build()))
}

fn signature(text: impl Into<String>) -> BusResult<Signature<'static>> {
    Signature::try_from(text.into()).map_err(invalid)
}

fn to_value(variant: &Variant) -> BusResult<Value<'static>> {
    Ok(match variant {
        Variant::Bool(value) => Value::Bool(*value),
        Variant::Int32(value) => Value::I32(*value),
        Variant::UInt32(value) => Value::U32(*value),
        Variant::Double(value) => Value::F64(*value),
        Variant::Str(value) => Value::from(value.clone()),
        Variant::ObjectPath(value) => {
            Value::ObjectPath(ObjectPath::try_from(value.clone()).map_err(invalid)?)
        }
        Variant::Array(items) => {
            // Arrays are homogeneous on the wire; the first element decides.
            let element = items.first().map_or_else(|| "v".to_string(), Variant::signature);
            let mut array = Array::new(signature(element)?);
            for item in items {
                array.append(to_value(item)?).map_err(invalid)?;
            }
            Value::Array(array)
        }
        Variant::Dict(entries) => {
            let mut dict = Dict::new(signature("s")?, signature("v")?);
            for (key, value) in entries {
                dict.append(Value::from(key.clone()), Value::Value(Box::new(to_value(value)?)))
                    .map_err(invalid)?;
            }
            Value::Dict(dict)
        }
        Variant::Tuple(items) => match body_structure(items)? {
            Some(structure) => Value::Structure(structure),
            None => return Err(BusError::InvalidArgs("empty tuple".into())),
        },
    })
}

fn from_value(value: &Value<'_>) -> BusResult<Variant> {
    Ok(match value {
        Value::Bool(value) => Variant::Bool(*value),
        Value::U8(value) => Variant::UInt32(u32::from(*value)),
        Value::U16(value) => Variant::UInt32(u32::from(*value)),
        Value::I16(value) => Variant::Int32(i32::from(*value)),
        Value::I32(value) => Variant::Int32(*value),
        Value::U32(value) => Variant::UInt32(*value),
        Value::F64(value) => Variant::Double(*value),
        Value::Str(value) => Variant::Str(value.to_string()),
        Value::ObjectPath(value) => Variant::ObjectPath(value.to_string()),
        Value::Value(inner) => from_value(inner)?,
        Value::Array(array) => {
            Variant::Array(array.iter().map(from_value).collect::<BusResult<_>>()?)
        }
        Value::Dict(dict) => {
            let mut entries = BTreeMap::new();
            for (key, value) in dict.iter() {
                let Value::Str(key) = key else {
                    return Err(BusError::InvalidArgs("dictionary keys must be strings".into()));
                };
                entries.insert(key.to_string(), from_value(value)?);
            }
            Variant::Dict(entries)
        }
        Value::Structure(structure) => Variant::Tuple(
            structure
                .fields()
                .iter()
                .map(from_value)
                .collect::<BusResult<_>>()?,
        ),
        other => {
            return Err(BusError::InvalidArgs(format!(
                "unsupported value type {}",
                other.value_signature()
            )))
        }
    })
}
