//! Names and paths of the applet factory protocol.

use std::fmt;
use std::str::FromStr;

use crate::error::{ContainerError, ContainerResult};

pub const DEFAULT_NAMESPACE: &str = "org.mate.panel";
pub const IDENTIFIER_SEPARATOR: &str = "::";

pub const GET_APPLET: &str = "GetApplet";
pub const POPUP_MENU: &str = "PopupMenu";

/// `<factory-id>::<applet-id>`, split at the last separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentId {
    factory_id: String,
    applet_id: String,
}

impl ComponentId {
    pub fn parse(raw: &str) -> ContainerResult<Self> {
        let invalid = || ContainerError::InvalidIdentifier(raw.to_string());
        let (factory_id, applet_id) = raw.rsplit_once(IDENTIFIER_SEPARATOR).ok_or_else(invalid)?;
        if factory_id.is_empty() || applet_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            factory_id: factory_id.to_string(),
            applet_id: applet_id.to_string(),
        })
    }

    pub fn factory_id(&self) -> &str {
        &self.factory_id
    }

    pub fn applet_id(&self) -> &str {
        &self.applet_id
    }
}

impl FromStr for ComponentId {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{IDENTIFIER_SEPARATOR}{}", self.factory_id, self.applet_id)
    }
}

/// Dotted prefix every applet service, path and interface is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn service_name(&self, factory_id: &str) -> String {
        format!("{}.applet.{factory_id}", self.0)
    }

    pub fn factory_path(&self, factory_id: &str) -> String {
        format!("/{}/applet/{factory_id}", self.0.replace('.', "/"))
    }

    pub fn factory_interface(&self) -> String {
        format!("{}.applet.AppletFactory", self.0)
    }

    pub fn applet_interface(&self) -> String {
        format!("{}.applet.Applet", self.0)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
