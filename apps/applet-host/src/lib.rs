//! Host side of out-of-process panel applets.
//!
//! An [`AppletContainer`] activates an applet through its factory on the
//! session bus, embeds the applet's surface, proxies its properties and
//! forwards its signals as [`ContainerEvent`]s. Every request that crosses
//! the process boundary is a cancellable [`PendingOperation`].

pub mod activation;
pub mod channel;
pub mod cli;
pub mod config;
pub mod container;
pub mod embedding;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod harness;
pub mod operations;
pub mod properties;
pub mod protocol;
pub mod signals;
pub mod telemetry;
pub mod testing;

pub use config::HostConfig;
pub use container::AppletContainer;
pub use embedding::{DisplayBackend, EmbedSocket, EmbedState, HeadlessDisplay, Propagation};
pub use error::{ContainerError, ContainerResult};
pub use events::{ContainerEvent, EventSubscription};
pub use operations::{OperationHandle, OperationKind, PendingOperation};
pub use protocol::{ComponentId, Namespace};
pub use signals::WatchedProperty;
