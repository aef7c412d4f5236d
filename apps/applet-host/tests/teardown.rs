mod common;

use std::sync::Arc;

use applet_bus::{BusError, LocalBus, Variant};
use applet_host::testing::{MockDisplay, MockFactory};
use applet_host::{
    AppletContainer, ContainerError, ContainerEvent, EmbedState, HostConfig, Namespace,
    Propagation,
};
use common::{IID, SERVICE, WAIT, harness, next_event, settle, wait_until};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn plug_removal_severs_the_session_once() {
    let h = harness(|factory| factory.with_reply("/obj/1", true, 0x40_0001, 9));
    h.load().await;
    let socket = h.display.last_socket().expect("socket");
    let mut events = h.container.subscribe();

    h.bus.hold_replies();
    let pending = h.container.get("size", &h.token).expect("live");
    assert_eq!(h.container.pending_operations().len(), 1);

    assert_eq!(socket.remove_plug(), Some(Propagation::Proceed));

    assert!(!h.container.is_live());
    assert!(h.container.endpoint().is_none());
    assert!(h.container.pending_operations().is_empty());
    assert_eq!(h.container.embed_state(), EmbedState::Detached);
    assert!(socket.is_destroyed());
    assert_eq!(h.bus.active_matches(), 0);
    assert_eq!(pending.await, Err(ContainerError::Cancelled));

    h.bus.release_replies();
    assert_eq!(socket.remove_plug(), None);
    assert_eq!(h.container.handle_plug_removed(), Propagation::Proceed);
    settle().await;
    assert_eq!(events.drain(), vec![ContainerEvent::AppletBroken]);

    h.load().await;
    assert!(h.container.is_live());
    assert_eq!(h.display.sockets().len(), 2);
    assert_eq!(h.container.embed_state(), EmbedState::Embedded);
}

#[tokio::test]
async fn owner_leaving_the_bus_breaks_the_applet() {
    let h = harness(|factory| factory.with_reply("/obj/1", true, 0x40_0001, 2));
    h.load().await;
    let socket = h.display.last_socket().expect("socket");
    let mut events = h.container.subscribe();

    assert!(h.factory.crash());

    assert_eq!(next_event(&mut events).await, ContainerEvent::AppletBroken);
    assert!(!h.container.is_live());
    assert!(socket.is_destroyed());
    assert_eq!(h.bus.active_matches(), 0);

    // The window system reporting the same loss afterwards is stale.
    assert_eq!(socket.remove_plug(), None);
    h.container.handle_plug_removed();
    settle().await;
    assert_eq!(events.try_recv(), None);
    wait_until(|| h.bus.active_watches() == 0).await;
}

#[tokio::test]
async fn cancelling_everything_suppresses_late_replies() {
    let h = harness(|factory| factory);
    h.load().await;
    let applet = h.factory.applet().expect("applet");
    let mut events = h.container.subscribe();

    h.bus.hold_replies();
    let get = h.container.get("size", &h.token).expect("get");
    let set = h
        .container
        .set("flags", Variant::UInt32(4), &h.token)
        .expect("set");
    let popup = h.container.popup_menu(1, 0, &h.token).expect("popup");
    assert_eq!(h.container.pending_operations().len(), 3);

    assert_eq!(h.container.cancel_pending_operations(), 3);
    assert!(h.container.pending_operations().is_empty());
    assert_eq!(get.await, Err(ContainerError::Cancelled));
    assert_eq!(set.await, Err(ContainerError::Cancelled));
    assert_eq!(popup.await, Err(ContainerError::Cancelled));

    h.bus.release_replies();
    settle().await;

    assert!(applet.writes().is_empty());
    assert!(applet.popup_requests().is_empty());
    assert_eq!(events.try_recv(), None);
    assert!(h.container.is_live());
    assert_eq!(h.container.cancel_pending_operations(), 0);
}

#[tokio::test]
async fn cancelling_one_operation_leaves_the_others() {
    let h = harness(|factory| factory);
    h.load().await;

    h.bus.hold_replies();
    let doomed = h.container.get("size", &h.token).expect("get");
    let kept = h.container.get("flags", &h.token).expect("get");

    assert!(h.container.cancel_operation(doomed.handle()));
    assert!(!h.container.cancel_operation(doomed.handle()));
    assert_eq!(h.container.pending_operations().len(), 1);

    h.bus.release_replies();
    assert_eq!(doomed.await, Err(ContainerError::Cancelled));
    assert_eq!(kept.await, Ok(Variant::UInt32(0)));
}

#[tokio::test]
async fn cancelling_a_finished_operation_is_a_no_op() {
    let h = harness(|factory| factory);
    h.load().await;

    let op = h.container.get("size", &h.token).expect("get");
    let handle = op.handle();
    assert_eq!(op.await, Ok(Variant::UInt32(24)));

    assert!(!h.container.cancel_operation(handle));
    assert!(h.container.is_live());
}

#[tokio::test]
async fn caller_token_cancels_its_operations() {
    let h = harness(|factory| factory);
    h.load().await;

    let caller = CancellationToken::new();
    h.bus.hold_replies();
    let op = h.container.get("size", &caller).expect("get");
    let other = h.container.get("size", &h.token).expect("get");
    caller.cancel();

    assert_eq!(op.await, Err(ContainerError::Cancelled));
    h.bus.release_replies();
    assert_eq!(other.await, Ok(Variant::UInt32(24)));
    assert!(h.container.pending_operations().is_empty());
}

#[tokio::test]
async fn cancelled_activation_leaves_nothing_behind() {
    let h = harness(|factory| factory);
    let caller = CancellationToken::new();

    h.bus.hold_replies();
    let op = h
        .container
        .add(IID, 0, Variant::empty_dict(), &caller)
        .expect("valid identifier");
    wait_until(|| h.bus.call_count("GetApplet") == 1).await;
    caller.cancel();

    assert_eq!(op.await, Err(ContainerError::Cancelled));
    h.bus.release_replies();
    settle().await;

    assert!(!h.container.is_live());
    assert_eq!(h.bus.active_matches(), 0);
    wait_until(|| h.bus.active_watches() == 0).await;
    assert!(h.display.sockets().is_empty());
    assert!(h.display.in_process_attachments().is_empty());
}

#[tokio::test]
async fn superseded_activation_is_cancelled() {
    let h = harness(|factory| factory);

    h.bus.hold_replies();
    let first = h
        .container
        .add(IID, 0, Variant::empty_dict(), &h.token)
        .expect("first");
    wait_until(|| h.bus.call_count("GetApplet") == 1).await;
    let second = h
        .container
        .add(IID, 1, Variant::empty_dict(), &h.token)
        .expect("second");
    h.bus.release_replies();

    assert_eq!(first.await, Err(ContainerError::Cancelled));
    tokio::time::timeout(WAIT, second)
        .await
        .expect("in time")
        .expect("second activation");
    assert!(h.container.is_live());
    assert_eq!(h.display.in_process_attachments(), vec![1]);
}

#[tokio::test]
async fn remove_releases_every_remote_resource() {
    let h = harness(|factory| factory.with_reply("/obj/1", true, 0x40_0001, 1));
    h.load().await;
    let socket = h.display.last_socket().expect("socket");
    let mut events = h.container.subscribe();

    assert!(h.container.remove());
    assert!(!h.container.remove());

    assert!(socket.is_destroyed());
    assert_eq!(h.bus.active_matches(), 0);
    assert!(h.container.component_id().is_none());
    wait_until(|| h.bus.active_watches() == 0).await;
    assert_eq!(events.try_recv(), None);
    assert_eq!(
        h.container.get("size", &h.token).map(|_| ()),
        Err(ContainerError::NotReady)
    );
}

#[tokio::test]
async fn dropping_the_container_tears_down() {
    let h = harness(|factory| factory.with_reply("/obj/1", true, 0x40_0001, 1));
    h.load().await;
    let socket = h.display.last_socket().expect("socket");
    let bus = h.bus.clone();

    drop(h.container);

    assert!(socket.is_destroyed());
    assert_eq!(bus.active_matches(), 0);
    wait_until(|| bus.active_watches() == 0).await;
}

#[tokio::test]
async fn missing_factory_fails_activation() {
    let bus = LocalBus::new();
    let container = AppletContainer::new(
        Arc::new(bus.clone()),
        Arc::new(MockDisplay::new()),
        &HostConfig::default(),
    );

    let result = container
        .add("missing::applet", 0, Variant::empty_dict(), &CancellationToken::new())
        .expect("valid identifier")
        .await;
    assert_eq!(
        result,
        Err(ContainerError::ActivationFailed(BusError::ServiceUnknown(
            "org.mate.panel.applet.missing".into()
        )))
    );
    assert!(!container.is_live());
    assert!(container.pending_operations().is_empty());
    assert_eq!(bus.call_count("GetApplet"), 0);
}

#[tokio::test]
async fn factory_that_never_claims_its_name_fails_activation() {
    let h = harness(MockFactory::failing_to_start);

    let result = h
        .container
        .add(IID, 0, Variant::empty_dict(), &h.token)
        .expect("valid identifier")
        .await;
    assert!(
        matches!(
            &result,
            Err(ContainerError::ActivationFailed(BusError::SpawnFailed { name, .. })) if name == SERVICE
        ),
        "unexpected result {result:?}"
    );
    assert!(!h.container.is_live());
}

#[tokio::test]
async fn malformed_factory_reply_fails_activation() {
    let h = harness(|factory| factory.with_raw_reply(vec![Variant::from("/obj/1")]));

    let result = h
        .container
        .add(IID, 0, Variant::empty_dict(), &h.token)
        .expect("valid identifier")
        .await;
    assert!(
        matches!(
            result,
            Err(ContainerError::ActivationFailed(BusError::InvalidArgs(_)))
        ),
        "unexpected result {result:?}"
    );
    assert!(!h.container.is_live());
    assert_eq!(h.bus.active_matches(), 0);
    assert_eq!(h.bus.call_count("Ping"), 0);
}

#[tokio::test]
async fn custom_namespace_routes_to_its_factory() {
    let config = HostConfig::from_toml_str("namespace = \"org.example.applets\"").expect("config");
    let bus = LocalBus::new();
    let factory = MockFactory::new(&config.namespace(), "orgtest");
    factory.install(&bus);
    let container = AppletContainer::new(
        Arc::new(bus.clone()),
        Arc::new(MockDisplay::new()),
        &config,
    );

    container
        .add(IID, 0, Variant::empty_dict(), &CancellationToken::new())
        .expect("valid identifier")
        .await
        .expect("activated");

    assert_eq!(
        container.service_name().as_deref(),
        Some("org.example.applets.orgtest")
    );
    assert_eq!(config.namespace(), Namespace::new("org.example.applets"));
    assert_eq!(bus.activation_count("org.example.applets.orgtest"), 1);
}
