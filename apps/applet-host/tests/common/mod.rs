#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use applet_bus::{LocalBus, Variant};
use applet_host::testing::{MockDisplay, MockFactory};
use applet_host::{AppletContainer, ContainerEvent, EventSubscription, HostConfig, Namespace};
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(2);
pub const IID: &str = "orgtest::clock";
pub const SERVICE: &str = "org.mate.panel.applet.orgtest";

pub struct Harness {
    pub bus: LocalBus,
    pub factory: MockFactory,
    pub display: MockDisplay,
    pub container: AppletContainer,
    pub token: CancellationToken,
}

pub fn harness(configure: impl FnOnce(MockFactory) -> MockFactory) -> Harness {
    let bus = LocalBus::new();
    let factory = configure(MockFactory::new(&Namespace::default(), "orgtest"));
    factory.install(&bus);
    let display = MockDisplay::new();
    let container = AppletContainer::new(
        Arc::new(bus.clone()),
        Arc::new(display.clone()),
        &HostConfig::default(),
    );
    Harness {
        bus,
        factory,
        display,
        container,
        token: CancellationToken::new(),
    }
}

impl Harness {
    pub async fn load(&self) {
        let op = self
            .container
            .add(IID, 0, Variant::empty_dict(), &self.token)
            .expect("valid identifier");
        tokio::time::timeout(WAIT, op)
            .await
            .expect("activation finished in time")
            .expect("activation succeeded");
    }
}

pub async fn next_event(events: &mut EventSubscription) -> ContainerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event stream open")
}

/// Gives spawned tasks a chance to run to quiescence.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition reached in time");
}
