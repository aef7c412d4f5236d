//! Command implementations behind the `applet-host` binary.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use applet_bus::{LocalBus, Variant};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel;
use crate::cli::{HostArgs, SimulateArgs};
use crate::config::HostConfig;
use crate::container::AppletContainer;
use crate::embedding::EmbedState;
use crate::endpoint::RemoteEndpoint;
use crate::error::ContainerResult;
use crate::events::{ContainerEvent, EventSubscription};
use crate::properties::PROPERTIES;
use crate::protocol::ComponentId;
use crate::testing::{MockDisplay, MockFactory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdReport {
    pub factory_id: String,
    pub applet_id: String,
    pub service: String,
    pub factory_path: String,
    pub factory_interface: String,
    pub applet_interface: String,
}

pub fn check_id(config: &HostConfig, iid: &str) -> ContainerResult<IdReport> {
    let id = ComponentId::parse(iid)?;
    let namespace = config.namespace();
    Ok(IdReport {
        service: namespace.service_name(id.factory_id()),
        factory_path: namespace.factory_path(id.factory_id()),
        factory_interface: namespace.factory_interface(),
        applet_interface: namespace.applet_interface(),
        factory_id: id.factory_id().to_string(),
        applet_id: id.applet_id().to_string(),
    })
}

impl fmt::Display for IdReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "factory id:        {}", self.factory_id)?;
        writeln!(f, "applet id:         {}", self.applet_id)?;
        writeln!(f, "service:           {}", self.service)?;
        writeln!(f, "factory path:      {}", self.factory_path)?;
        writeln!(f, "factory interface: {}", self.factory_interface)?;
        write!(f, "applet interface:  {}", self.applet_interface)
    }
}

pub fn property_table() -> String {
    let mut out = format!("{:<12} {:<11} {}\n", "NAME", "REMOTE", "TYPE");
    for descriptor in &PROPERTIES {
        out.push_str(&format!(
            "{:<12} {:<11} {}\n",
            descriptor.name,
            descriptor.remote_name,
            descriptor.kind.signature()
        ));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyValue {
    pub name: String,
    pub value: Variant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub component: String,
    pub endpoint: Option<RemoteEndpoint>,
    pub embed_state: EmbedState,
    pub values: Vec<PropertyValue>,
    pub events: Vec<ContainerEvent>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "component: {}", self.component)?;
        match &self.endpoint {
            Some(endpoint) => writeln!(
                f,
                "endpoint:  {} {} (out_of_process={}, embed_handle={}, instance_id={})",
                endpoint.owner,
                endpoint.object_path,
                endpoint.out_of_process,
                endpoint.embed_handle,
                endpoint.instance_id
            )?,
            None => writeln!(f, "endpoint:  none")?,
        }
        writeln!(f, "embedding: {:?}", self.embed_state)?;
        for value in &self.values {
            writeln!(f, "{} = {}", value.name, value.value)?;
        }
        for event in &self.events {
            write_event(f, event)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

fn write_event(f: &mut fmt::Formatter<'_>, event: &ContainerEvent) -> fmt::Result {
    match event {
        ContainerEvent::ChildPropertyChanged { property, value } => {
            write!(f, "event {}::{} {}", event.name(), property.local_name(), value)
        }
        ContainerEvent::AppletLock { locked } => write!(f, "event {} locked={locked}", event.name()),
        _ => write!(f, "event {}", event.name()),
    }
}

/// Hosts `args.iid` against a [`MockFactory`] on a private [`LocalBus`].
pub async fn simulate(config: &HostConfig, args: &SimulateArgs) -> anyhow::Result<SimulationReport> {
    let component = ComponentId::parse(&args.iid)?;
    let bus = LocalBus::new();
    let factory = MockFactory::new(&config.namespace(), component.factory_id()).with_reply(
        "/obj/1",
        args.out_of_process,
        args.embed_handle,
        1,
    );
    factory.install(&bus);
    let display = MockDisplay::new();

    let container = AppletContainer::new(Arc::new(bus.clone()), Arc::new(display), config);
    let mut events = container.subscribe();
    let mut broken = container.subscribe();
    let token = CancellationToken::new();

    let placement_hint = args.placement_hint.unwrap_or(config.placement_hint);
    container
        .add(&args.iid, placement_hint, Variant::empty_dict(), &token)?
        .await
        .with_context(|| format!("failed to load {component}"))?;
    info!(target = "applet.container", %component, "simulated applet loaded");

    for (name, text) in &args.sets {
        let descriptor = channel::descriptor(name)?;
        let value = descriptor
            .kind
            .parse(text)
            .map_err(|reason| anyhow!("invalid value for {name}: {reason}"))?;
        container
            .set(name, value, &token)?
            .await
            .with_context(|| format!("failed to set {name}"))?;
    }

    let mut values = Vec::with_capacity(args.gets.len());
    for name in &args.gets {
        let value = container
            .get(name, &token)?
            .await
            .with_context(|| format!("failed to read {name}"))?;
        values.push(PropertyValue {
            name: name.clone(),
            value,
        });
    }

    if args.popup {
        container
            .popup_menu(1, 0, &token)?
            .await
            .context("failed to request the popup menu")?;
    }

    let endpoint = container.endpoint();
    let embed_state = container.embed_state();

    if args.crash {
        debug!(target = "applet.container", "crashing simulated factory");
        if !factory.crash() {
            bail!("factory for {component} was never started");
        }
        tokio::time::timeout(config.call_timeout(), async {
            while let Some(event) = broken.recv().await {
                if event == ContainerEvent::AppletBroken {
                    return true;
                }
            }
            false
        })
        .await
        .ok()
        .filter(|seen| *seen)
        .context("container did not report the crashed applet")?;
    }

    let mut delivered = settle(&mut events).await;
    container.remove();
    delivered.extend(events.drain());
    Ok(SimulationReport {
        component: component.to_string(),
        endpoint,
        embed_state,
        values,
        events: delivered,
    })
}

/// One line of `host` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostUpdate {
    Event(ContainerEvent),
    Value(PropertyValue),
}

impl fmt::Display for HostUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostUpdate::Event(event) => write_event(f, event),
            HostUpdate::Value(value) => write!(f, "{} = {}", value.name, value.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    Shutdown,
    Broken,
}

/// Loads `args.iid` into `container`, reports the requested values and then
/// every event until `shutdown` resolves or the applet breaks.
pub async fn serve(
    container: &AppletContainer,
    args: &HostArgs,
    placement_hint: i32,
    shutdown: impl Future<Output = ()>,
    mut on_update: impl FnMut(HostUpdate),
) -> anyhow::Result<HostExit> {
    let component = ComponentId::parse(&args.iid)?;
    let mut events = container.subscribe();
    let token = CancellationToken::new();

    container
        .add(&args.iid, placement_hint, Variant::empty_dict(), &token)?
        .await
        .with_context(|| format!("failed to load {component}"))?;
    info!(target = "applet.container", %component, "applet loaded");
    for event in events.drain() {
        on_update(HostUpdate::Event(event));
    }

    for name in &args.gets {
        let value = container
            .get(name, &token)?
            .await
            .with_context(|| format!("failed to read {name}"))?;
        on_update(HostUpdate::Value(PropertyValue {
            name: name.clone(),
            value,
        }));
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let event = event.context("container event stream closed")?;
                let broken = event == ContainerEvent::AppletBroken;
                on_update(HostUpdate::Event(event));
                if broken {
                    return Ok(HostExit::Broken);
                }
            }
            () = &mut shutdown => {
                info!(target = "applet.container", %component, "unloading applet");
                token.cancel();
                container.remove();
                return Ok(HostExit::Shutdown);
            }
        }
    }
}

/// Hosts `args.iid` from the session bus without a window system.
#[cfg(feature = "session-bus")]
pub async fn host(
    config: &HostConfig,
    args: &HostArgs,
    shutdown: impl Future<Output = ()>,
    on_update: impl FnMut(HostUpdate),
) -> anyhow::Result<HostExit> {
    let bus = applet_bus::SessionBus::connect()
        .await
        .context("failed to connect to the session bus")?;
    let container = AppletContainer::new(
        Arc::new(bus),
        Arc::new(crate::embedding::HeadlessDisplay),
        config,
    );
    let placement_hint = args.placement_hint.unwrap_or(config.placement_hint);
    serve(&container, args, placement_hint, shutdown, on_update).await
}

const QUIET_ROUNDS: usize = 8;

/// Yields to the signal pumps until several consecutive turns forward
/// nothing new, returning what they delivered.
async fn settle(events: &mut EventSubscription) -> Vec<ContainerEvent> {
    let mut delivered = Vec::new();
    let mut quiet = 0;
    while quiet < QUIET_ROUNDS {
        tokio::task::yield_now().await;
        let batch = events.drain();
        if batch.is_empty() {
            quiet += 1;
        } else {
            quiet = 0;
            delivered.extend(batch);
        }
    }
    delivered
}
