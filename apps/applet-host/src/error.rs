use applet_bus::BusError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    #[error("invalid applet identifier '{0}', expected <factory-id>::<applet-id>")]
    InvalidIdentifier(String),
    #[error("unknown applet property '{0}'")]
    UnknownProperty(String),
    #[error("applet is not ready")]
    NotReady,
    #[error("applet activation failed: {0}")]
    ActivationFailed(#[source] BusError),
    #[error("applet call failed: {0}")]
    Remote(#[source] BusError),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("lost connection to the applet")]
    RemoteLost,
}

impl ContainerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ContainerError::Cancelled)
    }
}

pub type ContainerResult<T> = Result<T, ContainerError>;
