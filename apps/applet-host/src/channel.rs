//! Property reads and writes against a live applet.

use applet_bus::Variant;
use tracing::debug;

use crate::endpoint::{BusHandle, RemoteEndpoint};
use crate::error::{ContainerError, ContainerResult};
use crate::properties::{self, PropertyDescriptor};
use crate::protocol::POPUP_MENU;

/// Resolves a local property name. Checked before readiness so an
/// unknown name is reported the same way whether or not the applet is up.
pub fn descriptor(name: &str) -> ContainerResult<&'static PropertyDescriptor> {
    properties::lookup(name).ok_or_else(|| ContainerError::UnknownProperty(name.to_string()))
}

#[derive(Debug, Clone)]
pub struct PropertyChannel {
    bus: BusHandle,
    endpoint: RemoteEndpoint,
}

impl PropertyChannel {
    pub fn new(bus: BusHandle, endpoint: RemoteEndpoint) -> Self {
        Self { bus, endpoint }
    }

    pub async fn get(&self, descriptor: &PropertyDescriptor) -> ContainerResult<Variant> {
        let reply = self
            .bus
            .call(
                self.endpoint
                    .properties_call("Get", vec![Variant::from(descriptor.remote_name)]),
            )
            .await
            .map_err(ContainerError::Remote)?;
        let value = reply.into_iter().next().ok_or_else(|| {
            ContainerError::MalformedReply(format!("Get({}) returned no value", descriptor.remote_name))
        })?;
        debug!(
            target = "applet.container",
            property = descriptor.name,
            value = %value,
            "property read"
        );
        Ok(value)
    }

    pub async fn set(&self, descriptor: &PropertyDescriptor, value: Variant) -> ContainerResult<()> {
        self.bus
            .call(self.endpoint.properties_call(
                "Set",
                vec![Variant::from(descriptor.remote_name), value],
            ))
            .await
            .map_err(ContainerError::Remote)?;
        debug!(target = "applet.container", property = descriptor.name, "property written");
        Ok(())
    }

    pub async fn popup_menu(&self, button: u32, timestamp: u32) -> ContainerResult<()> {
        self.bus
            .call(self.endpoint.applet_call(
                POPUP_MENU,
                vec![Variant::UInt32(button), Variant::UInt32(timestamp)],
            ))
            .await
            .map_err(ContainerError::Remote)?;
        Ok(())
    }
}
