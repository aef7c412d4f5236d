//! Client-side view of a session-style message bus: request/reply calls,
//! name ownership with activation on demand, broadcast signals and the
//! standard properties protocol.
//!
//! The applet container only ever talks to a [`Bus`]; [`LocalBus`] is an
//! in-memory implementation for tests and the development harness. With the
//! `session` feature, [`SessionBus`] speaks to the real session bus.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod local;
#[cfg(feature = "session")]
pub mod session;
mod variant;

pub use local::{LocalBus, LocalObject, ObjectContext, WeakLocalBus};
#[cfg(feature = "session")]
pub use session::SessionBus;
pub use variant::Variant;

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("name {0} has no owner and is not activatable")]
    ServiceUnknown(String),
    #[error("failed to activate {name}: {reason}")]
    SpawnFailed { name: String, reason: String },
    #[error("no object at {path} on {destination}")]
    UnknownObject { destination: String, path: String },
    #[error("unknown method {interface}.{member}")]
    UnknownMethod { interface: String, member: String },
    #[error("unknown property {0}")]
    UnknownProperty(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("remote error {name}: {message}")]
    Remote { name: String, message: String },
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    /// Maps an error reply to `call` onto the closest variant.
    pub fn from_error_reply(call: &MethodCall, name: &str, message: String) -> Self {
        match name.strip_prefix("org.freedesktop.DBus.Error.") {
            Some("ServiceUnknown" | "NameHasNoOwner") => {
                BusError::ServiceUnknown(call.destination.clone())
            }
            Some("UnknownObject") => BusError::UnknownObject {
                destination: call.destination.clone(),
                path: call.path.clone(),
            },
            Some("UnknownMethod" | "UnknownInterface") => BusError::UnknownMethod {
                interface: call.interface.clone(),
                member: call.member.clone(),
            },
            Some("UnknownProperty") => {
                // Get and Set carry the property name as their second argument.
                let property = match call.interface.as_str() {
                    PROPERTIES_INTERFACE => call.body.get(1).and_then(Variant::as_str),
                    _ => None,
                };
                BusError::UnknownProperty(property.map_or(message, str::to_string))
            }
            Some("InvalidArgs") => BusError::InvalidArgs(message),
            Some("Disconnected") => BusError::Closed,
            _ => BusError::Remote {
                name: name.to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// Fail instead of starting the destination when it has no owner.
    pub no_auto_start: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Variant>,
    pub flags: CallFlags,
}

impl MethodCall {
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body: Vec::new(),
            flags: CallFlags::default(),
        }
    }

    pub fn with_body(mut self, body: Vec<Variant>) -> Self {
        self.body = body;
        self
    }

    pub fn no_auto_start(mut self) -> Self {
        self.flags.no_auto_start = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<Variant>,
}

impl SignalMessage {
    pub fn arg0_str(&self) -> Option<&str> {
        self.body.first().and_then(Variant::as_str)
    }
}

/// Filter selecting which broadcast signals a subscription receives.
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub arg0: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    pub fn matches(&self, message: &SignalMessage) -> bool {
        fn field(rule: &Option<String>, value: &str) -> bool {
            rule.as_deref().map_or(true, |expected| expected == value)
        }

        field(&self.sender, &message.sender)
            && field(&self.path, &message.path)
            && field(&self.interface, &message.interface)
            && field(&self.member, &message.member)
            && self
                .arg0
                .as_deref()
                .map_or(true, |expected| message.arg0_str() == Some(expected))
    }
}

/// Renders the rule in bus match-rule syntax, e.g.
/// `sender=':1.4',member='Lock'`. Quotes inside values are escaped.
impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("arg0", &self.arg0),
        ];
        let mut separator = "";
        for (key, value) in fields {
            if let Some(value) = value {
                write!(f, "{separator}{key}='{}'", value.replace('\'', r"'\''"))?;
                separator = ",";
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchId(pub u64);

/// Signals delivered for one installed [`MatchRule`]. The stream ends once
/// the match is removed.
#[derive(Debug)]
pub struct SignalSubscription {
    pub id: MatchId,
    pub messages: mpsc::UnboundedReceiver<SignalMessage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchFlags {
    /// Ask the bus to start the service if nobody owns the name yet.
    pub auto_start: bool,
}

/// A registered interest in the owner of a well-known name. Dropping the
/// watch unregisters it.
#[async_trait]
pub trait NameWatch: Send {
    fn name(&self) -> &str;

    /// Resolves with the unique name of the current owner, activating the
    /// service first when the watch was created with `auto_start`.
    async fn appeared(&mut self) -> BusResult<String>;

    /// Resolves once the name has no owner.
    async fn vanished(&mut self) -> BusResult<()>;
}

#[async_trait]
pub trait Bus: Send + Sync {
    fn watch_name(&self, name: &str, flags: WatchFlags) -> Box<dyn NameWatch>;

    /// Performs a method call and returns the reply body.
    async fn call(&self, call: MethodCall) -> BusResult<Vec<Variant>>;

    fn add_match(&self, rule: MatchRule) -> BusResult<SignalSubscription>;

    fn remove_match(&self, id: MatchId);
}
