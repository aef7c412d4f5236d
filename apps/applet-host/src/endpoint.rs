use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use applet_bus::{
    Bus, BusError, BusResult, MatchId, MatchRule, MethodCall, NameWatch, PROPERTIES_INTERFACE,
    SignalMessage, Variant, WatchFlags,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Shared bus connection with the per-call deadline applied.
#[derive(Clone)]
pub struct BusHandle {
    bus: Arc<dyn Bus>,
    call_timeout: Duration,
}

impl BusHandle {
    pub fn new(bus: Arc<dyn Bus>, call_timeout: Duration) -> Self {
        Self { bus, call_timeout }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn call(&self, call: MethodCall) -> BusResult<Vec<Variant>> {
        trace!(
            target = "applet.bus",
            destination = %call.destination,
            path = %call.path,
            member = %call.member,
            "bus call"
        );
        match tokio::time::timeout(self.call_timeout, self.bus.call(call)).await {
            Ok(reply) => reply,
            Err(_) => Err(BusError::Timeout(self.call_timeout)),
        }
    }

    pub fn watch_name(&self, name: &str, flags: WatchFlags) -> Box<dyn NameWatch> {
        self.bus.watch_name(name, flags)
    }

    pub fn subscribe(&self, rule: MatchRule) -> BusResult<SignalStream> {
        let subscription = self.bus.add_match(rule)?;
        Ok(SignalStream {
            guard: MatchGuard {
                bus: self.bus.clone(),
                id: subscription.id,
            },
            messages: subscription.messages,
        })
    }
}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHandle")
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Removes its match rule from the bus when dropped.
pub struct MatchGuard {
    bus: Arc<dyn Bus>,
    id: MatchId,
}

impl MatchGuard {
    pub fn id(&self) -> MatchId {
        self.id
    }
}

impl Drop for MatchGuard {
    fn drop(&mut self) {
        self.bus.remove_match(self.id);
        trace!(target = "applet.bus", match_id = self.id.0, "match removed");
    }
}

impl fmt::Debug for MatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MatchGuard").field(&self.id).finish()
    }
}

/// Signals for one installed match rule.
#[derive(Debug)]
pub struct SignalStream {
    guard: MatchGuard,
    messages: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalStream {
    pub async fn next(&mut self) -> Option<SignalMessage> {
        self.messages.recv().await
    }

    /// Separates the subscription from its messages so the match can be
    /// removed without waiting for whoever consumes the stream.
    pub fn into_parts(self) -> (MatchGuard, mpsc::UnboundedReceiver<SignalMessage>) {
        (self.guard, self.messages)
    }
}

/// A live applet instance as returned by its factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEndpoint {
    pub owner: String,
    pub object_path: String,
    pub interface: String,
    pub out_of_process: bool,
    pub embed_handle: u32,
    pub instance_id: u32,
}

impl RemoteEndpoint {
    /// A call on the applet interface. Never auto-starts: if the owner is
    /// gone the applet is gone.
    pub fn applet_call(&self, member: &str, body: Vec<Variant>) -> MethodCall {
        MethodCall::new(&self.owner, &self.object_path, &self.interface, member)
            .with_body(body)
            .no_auto_start()
    }

    pub fn properties_call(&self, member: &str, mut body: Vec<Variant>) -> MethodCall {
        body.insert(0, Variant::from(self.interface.as_str()));
        MethodCall::new(&self.owner, &self.object_path, PROPERTIES_INTERFACE, member)
            .with_body(body)
            .no_auto_start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applet_bus::LocalBus;

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint {
            owner: ":1.7".into(),
            object_path: "/obj/1".into(),
            interface: "org.mate.panel.applet.Applet".into(),
            out_of_process: true,
            embed_handle: 0,
            instance_id: 7,
        }
    }

    #[test]
    fn properties_calls_carry_the_interface_first() {
        let call = endpoint().properties_call("Get", vec![Variant::from("Size")]);
        assert_eq!(call.interface, PROPERTIES_INTERFACE);
        assert_eq!(call.destination, ":1.7");
        assert!(call.flags.no_auto_start);
        assert_eq!(
            call.body,
            vec![
                Variant::from("org.mate.panel.applet.Applet"),
                Variant::from("Size")
            ]
        );
    }

    #[tokio::test]
    async fn dropping_the_guard_removes_the_match() {
        let bus = LocalBus::new();
        let handle = BusHandle::new(Arc::new(bus.clone()), Duration::from_secs(1));
        let stream = handle.subscribe(MatchRule::new().member("Move")).expect("subscribe");
        assert_eq!(bus.active_matches(), 1);

        let (guard, mut messages) = stream.into_parts();
        drop(guard);
        assert_eq!(bus.active_matches(), 0);
        assert!(messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn calls_past_the_deadline_time_out() {
        let bus = LocalBus::new();
        bus.hold_replies();
        let handle = BusHandle::new(Arc::new(bus.clone()), Duration::from_millis(20));
        let err = handle
            .call(MethodCall::new("org.test.Nobody", "/", "org.test.Iface", "Ping"))
            .await
            .expect_err("held reply");
        assert_eq!(err, BusError::Timeout(Duration::from_millis(20)));
    }
}
