//! Placing an out-of-process applet's surface into the host window tree.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::RemoteEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedState {
    Detached,
    Embedded,
}

/// What a plug-removed handler tells the windowing system to do next.
/// The container always answers `Proceed` so its widget survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Proceed,
    Stop,
}

pub type PlugRemovedHandler = Arc<dyn Fn() -> Propagation + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    #[error("display has no socket embedding support")]
    Unsupported,
    #[error("embedding failed: {0}")]
    Failed(String),
}

/// Window-system capabilities the container relies on.
pub trait DisplayBackend: Send + Sync {
    fn supports_sockets(&self) -> bool;

    fn create_socket(&self) -> Result<Box<dyn EmbedSocket>, EmbedError>;

    /// Hosts an applet that renders inside this process.
    fn attach_in_process(&self, instance_id: u32) -> Result<(), EmbedError>;
}

/// A display with no window system behind it, for hosting applets from a
/// terminal. In-process applets cannot render and out-of-process ones run
/// unembedded.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessDisplay;

impl DisplayBackend for HeadlessDisplay {
    fn supports_sockets(&self) -> bool {
        false
    }

    fn create_socket(&self) -> Result<Box<dyn EmbedSocket>, EmbedError> {
        Err(EmbedError::Unsupported)
    }

    fn attach_in_process(&self, _instance_id: u32) -> Result<(), EmbedError> {
        Err(EmbedError::Unsupported)
    }
}

/// A local socket attached to the container widget. Dropping it destroys
/// the socket.
pub trait EmbedSocket: Send {
    fn on_plug_removed(&mut self, handler: PlugRemovedHandler);

    fn add_id(&mut self, handle: u32) -> Result<(), EmbedError>;
}

pub struct Embedding {
    state: EmbedState,
    socket: Option<Box<dyn EmbedSocket>>,
}

impl Embedding {
    pub fn detached() -> Self {
        Self {
            state: EmbedState::Detached,
            socket: None,
        }
    }

    pub fn state(&self) -> EmbedState {
        self.state
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Embeds the applet described by `endpoint`. Failures leave the
    /// applet running unembedded; none of them is fatal.
    pub fn attach(
        display: &dyn DisplayBackend,
        endpoint: &RemoteEndpoint,
        on_removed: PlugRemovedHandler,
    ) -> Self {
        if !endpoint.out_of_process {
            if let Err(err) = display.attach_in_process(endpoint.instance_id) {
                warn!(
                    target = "applet.embed",
                    instance_id = endpoint.instance_id,
                    error = %err,
                    "failed to attach in-process applet"
                );
            }
            return Self::detached();
        }

        if endpoint.embed_handle == 0 {
            debug!(target = "applet.embed", "applet supplied no embed handle; running unembedded");
            return Self::detached();
        }

        if !display.supports_sockets() {
            warn!(
                target = "applet.embed",
                embed_handle = endpoint.embed_handle,
                "out-of-process applet requested but display cannot embed; running unembedded"
            );
            return Self::detached();
        }

        let mut socket = match display.create_socket() {
            Ok(socket) => socket,
            Err(err) => {
                warn!(target = "applet.embed", error = %err, "failed to create embed socket");
                return Self::detached();
            }
        };
        socket.on_plug_removed(on_removed);
        if let Err(err) = socket.add_id(endpoint.embed_handle) {
            warn!(
                target = "applet.embed",
                embed_handle = endpoint.embed_handle,
                error = %err,
                "failed to embed applet surface"
            );
            return Self::detached();
        }

        info!(target = "applet.embed", embed_handle = endpoint.embed_handle, "applet surface embedded");
        Self {
            state: EmbedState::Embedded,
            socket: Some(socket),
        }
    }

    /// Releases the socket.
    pub fn detach(&mut self) {
        if self.socket.take().is_some() {
            debug!(target = "applet.embed", "embed socket released");
        }
        self.state = EmbedState::Detached;
    }
}

impl Default for Embedding {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("state", &self.state)
            .field("socket", &self.socket.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDisplay;

    fn endpoint(out_of_process: bool, embed_handle: u32) -> RemoteEndpoint {
        RemoteEndpoint {
            owner: ":1.2".into(),
            object_path: "/obj/1".into(),
            interface: "org.mate.panel.applet.Applet".into(),
            out_of_process,
            embed_handle,
            instance_id: 3,
        }
    }

    fn proceed() -> PlugRemovedHandler {
        Arc::new(|| Propagation::Proceed)
    }

    #[test]
    fn embeds_out_of_process_surface() {
        let display = MockDisplay::new();
        let mut embedding = Embedding::attach(&display, &endpoint(true, 0x2a00001), proceed());
        assert_eq!(embedding.state(), EmbedState::Embedded);

        let sockets = display.sockets();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].embedded_handle(), Some(0x2a00001));

        embedding.detach();
        assert_eq!(embedding.state(), EmbedState::Detached);
        assert!(sockets[0].is_destroyed());
    }

    #[test]
    fn in_process_applets_never_get_a_socket() {
        let display = MockDisplay::new();
        let embedding = Embedding::attach(&display, &endpoint(false, 0), proceed());
        assert_eq!(embedding.state(), EmbedState::Detached);
        assert!(display.sockets().is_empty());
        assert_eq!(display.in_process_attachments(), vec![3]);
    }

    #[test]
    fn zero_handle_runs_unembedded() {
        let display = MockDisplay::new();
        let embedding = Embedding::attach(&display, &endpoint(true, 0), proceed());
        assert_eq!(embedding.state(), EmbedState::Detached);
        assert!(display.sockets().is_empty());
    }

    #[test]
    fn display_without_sockets_degrades() {
        let display = MockDisplay::without_sockets();
        let embedding = Embedding::attach(&display, &endpoint(true, 9), proceed());
        assert_eq!(embedding.state(), EmbedState::Detached);
        assert!(!embedding.has_socket());
    }

    #[test]
    fn headless_display_hosts_everything_unembedded() {
        for out_of_process in [true, false] {
            let embedding = Embedding::attach(&HeadlessDisplay, &endpoint(out_of_process, 9), proceed());
            assert_eq!(embedding.state(), EmbedState::Detached);
            assert!(!embedding.has_socket());
        }
        assert_eq!(HeadlessDisplay.create_socket().err(), Some(EmbedError::Unsupported));
    }

    #[test]
    fn failed_embed_releases_the_socket() {
        let display = MockDisplay::new().failing_embeds();
        let embedding = Embedding::attach(&display, &endpoint(true, 9), proceed());
        assert_eq!(embedding.state(), EmbedState::Detached);
        let sockets = display.sockets();
        assert_eq!(sockets.len(), 1);
        assert!(sockets[0].is_destroyed());
    }
}
