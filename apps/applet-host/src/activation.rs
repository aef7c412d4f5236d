//! Turning an applet identifier into a live remote endpoint.
//!
//! The handshake is: watch the factory's service name (starting the
//! factory if needed), ask the factory for the applet, check that the
//! returned object answers, then subscribe to its signals. Every step is a
//! plain `await`, so dropping the future at any point drops the name watch
//! and whatever subscriptions were already installed.

use std::fmt;

use applet_bus::{
    BusError, MatchRule, MethodCall, NameWatch, PEER_INTERFACE, PROPERTIES_CHANGED,
    PROPERTIES_INTERFACE, Variant, WatchFlags,
};
use tracing::{debug, info};

use crate::endpoint::{BusHandle, RemoteEndpoint, SignalStream};
use crate::error::{ContainerError, ContainerResult};
use crate::protocol::{ComponentId, GET_APPLET, Namespace};

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRequest {
    pub component: ComponentId,
    pub placement_hint: i32,
    pub params: Variant,
}

pub struct Activation {
    pub endpoint: RemoteEndpoint,
    pub applet_signals: SignalStream,
    pub property_signals: SignalStream,
    /// Still watching the factory name; resolves `vanished` when the
    /// factory process leaves the bus.
    pub owner_watch: Box<dyn NameWatch>,
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("endpoint", &self.endpoint)
            .field("owner_watch", &self.owner_watch.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ActivationClient {
    bus: BusHandle,
    namespace: Namespace,
}

impl ActivationClient {
    pub fn new(bus: BusHandle, namespace: Namespace) -> Self {
        Self { bus, namespace }
    }

    pub async fn activate(&self, request: &ActivationRequest) -> ContainerResult<Activation> {
        let factory_id = request.component.factory_id();
        let service = self.namespace.service_name(factory_id);

        debug!(target = "applet.activation", %service, "waiting for factory owner");
        let mut owner_watch = self
            .bus
            .watch_name(&service, WatchFlags { auto_start: true });
        let owner = match tokio::time::timeout(self.bus.call_timeout(), owner_watch.appeared()).await
        {
            Ok(owner) => owner.map_err(ContainerError::ActivationFailed)?,
            Err(_) => {
                return Err(ContainerError::ActivationFailed(BusError::Timeout(
                    self.bus.call_timeout(),
                )));
            }
        };

        let interface = self.namespace.applet_interface();
        let reply = self
            .bus
            .call(
                MethodCall::new(
                    &owner,
                    self.namespace.factory_path(factory_id),
                    self.namespace.factory_interface(),
                    GET_APPLET,
                )
                .with_body(vec![
                    Variant::from(request.component.applet_id()),
                    Variant::Int32(request.placement_hint),
                    request.params.clone(),
                ]),
            )
            .await
            .map_err(ContainerError::ActivationFailed)?;
        let endpoint = parse_factory_reply(&owner, &interface, &reply)?;

        self.bus
            .call(
                MethodCall::new(&owner, &endpoint.object_path, PEER_INTERFACE, "Ping")
                    .no_auto_start(),
            )
            .await
            .map_err(ContainerError::ActivationFailed)?;

        let applet_signals = self
            .bus
            .subscribe(
                MatchRule::new()
                    .sender(&owner)
                    .path(&endpoint.object_path)
                    .interface(&interface),
            )
            .map_err(ContainerError::ActivationFailed)?;
        let property_signals = self
            .bus
            .subscribe(
                MatchRule::new()
                    .sender(&owner)
                    .path(&endpoint.object_path)
                    .interface(PROPERTIES_INTERFACE)
                    .member(PROPERTIES_CHANGED)
                    .arg0(&interface),
            )
            .map_err(ContainerError::ActivationFailed)?;

        info!(
            target = "applet.activation",
            component = %request.component,
            owner = %endpoint.owner,
            path = %endpoint.object_path,
            out_of_process = endpoint.out_of_process,
            embed_handle = endpoint.embed_handle,
            instance_id = endpoint.instance_id,
            "applet activated"
        );

        Ok(Activation {
            endpoint,
            applet_signals,
            property_signals,
            owner_watch,
        })
    }
}

/// `GetApplet` replies `(o, b, u, u)`: object path, out-of-process flag,
/// embed handle and instance id.
pub fn parse_factory_reply(
    owner: &str,
    interface: &str,
    reply: &[Variant],
) -> ContainerResult<RemoteEndpoint> {
    match reply {
        [
            Variant::ObjectPath(object_path),
            Variant::Bool(out_of_process),
            Variant::UInt32(embed_handle),
            Variant::UInt32(instance_id),
        ] => Ok(RemoteEndpoint {
            owner: owner.to_string(),
            object_path: object_path.clone(),
            interface: interface.to_string(),
            out_of_process: *out_of_process,
            embed_handle: *embed_handle,
            instance_id: *instance_id,
        }),
        other => {
            let signature: String = other.iter().map(Variant::signature).collect();
            Err(ContainerError::ActivationFailed(BusError::InvalidArgs(
                format!("{GET_APPLET} replied ({signature}), expected (obuu)"),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_factory_reply() {
        let reply = [
            Variant::object_path("/obj/1"),
            Variant::Bool(false),
            Variant::UInt32(0),
            Variant::UInt32(7),
        ];
        let endpoint =
            parse_factory_reply(":1.3", "org.mate.panel.applet.Applet", &reply).expect("endpoint");
        assert_eq!(endpoint.object_path, "/obj/1");
        assert!(!endpoint.out_of_process);
        assert_eq!(endpoint.embed_handle, 0);
        assert_eq!(endpoint.instance_id, 7);
        assert_eq!(endpoint.owner, ":1.3");
    }

    #[test]
    fn rejects_replies_of_the_wrong_shape() {
        let reply = [Variant::from("/obj/1"), Variant::Bool(true)];
        let err = parse_factory_reply(":1.3", "iface", &reply).expect_err("malformed");
        assert_eq!(
            err,
            ContainerError::ActivationFailed(BusError::InvalidArgs(
                "GetApplet replied (sb), expected (obuu)".into()
            ))
        );
    }
}
