//! Bookkeeping for every call that crosses the process boundary.
//!
//! Each in-flight request is tracked by an [`OperationHandle`] and owns a
//! [`CancellationToken`]. A handle leaves the registry exactly once: either
//! the work finishes and [`OperationRegistry::complete_and_remove`] claims
//! it, or a cancel claims it first. Whoever loses that race observes the
//! operation as gone, so a reply arriving after cancellation never reaches
//! session state.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ContainerError, ContainerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationHandle(u64);

impl OperationHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Activate,
    GetProperty,
    SetProperty,
    PopupMenu,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Activate => "activate",
            OperationKind::GetProperty => "get_property",
            OperationKind::SetProperty => "set_property",
            OperationKind::PopupMenu => "popup_menu",
        }
    }
}

struct Tracked {
    kind: OperationKind,
    token: CancellationToken,
}

#[derive(Default)]
pub struct OperationRegistry {
    next: AtomicU64,
    entries: Mutex<HashMap<OperationHandle, Tracked>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_handle(&self) -> OperationHandle {
        OperationHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, handle: OperationHandle, kind: OperationKind, token: CancellationToken) {
        self.entries.lock().insert(handle, Tracked { kind, token });
        trace!(target = "applet.ops", %handle, kind = kind.as_str(), "operation registered");
    }

    /// Cancels one operation. Unknown or already finished handles are
    /// ignored and report `false`.
    pub fn cancel(&self, handle: OperationHandle) -> bool {
        let Some(tracked) = self.entries.lock().remove(&handle) else {
            return false;
        };
        tracked.token.cancel();
        debug!(target = "applet.ops", %handle, kind = tracked.kind.as_str(), "operation cancelled");
        true
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, tracked) in &drained {
            tracked.token.cancel();
        }
        if !drained.is_empty() {
            debug!(target = "applet.ops", count = drained.len(), "cancelled pending operations");
        }
        drained.len()
    }

    /// Claims a finished operation. Returns `false` when it was cancelled
    /// (or never registered), in which case its result must be discarded.
    pub fn complete_and_remove(&self, handle: OperationHandle) -> bool {
        self.entries.lock().remove(&handle).is_some()
    }

    pub fn contains(&self, handle: OperationHandle) -> bool {
        self.entries.lock().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn pending(&self) -> Vec<(OperationHandle, OperationKind)> {
        let mut pending: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(handle, tracked)| (*handle, tracked.kind))
            .collect();
        pending.sort_by_key(|(handle, _)| *handle);
        pending
    }
}

/// Caller side of a tracked operation. Await it for the outcome; dropping
/// it does not cancel the request.
#[must_use = "the outcome of the operation is only observable by awaiting it"]
pub struct PendingOperation<T> {
    handle: OperationHandle,
    kind: OperationKind,
    token: CancellationToken,
    outcome: oneshot::Receiver<ContainerResult<T>>,
}

impl<T> PendingOperation<T> {
    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<T> fmt::Debug for PendingOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = ContainerResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(ContainerError::Cancelled)))
    }
}

/// Runs `work` as a tracked operation on the current runtime.
///
/// The operation gets a child of `parent`, so cancelling the caller's
/// token cancels it while cancelling the operation leaves the caller's
/// token alone. `apply` runs only when the operation was still registered
/// at completion; otherwise the result is dropped and the caller sees
/// [`ContainerError::Cancelled`].
pub(crate) fn spawn_tracked<R, T, W, A>(
    registry: &Arc<OperationRegistry>,
    kind: OperationKind,
    parent: &CancellationToken,
    work: W,
    apply: A,
) -> PendingOperation<T>
where
    R: Send + 'static,
    T: Send + 'static,
    W: Future<Output = ContainerResult<R>> + Send + 'static,
    A: FnOnce(R) -> ContainerResult<T> + Send + 'static,
{
    let handle = registry.next_handle();
    let token = parent.child_token();
    registry.register(handle, kind, token.clone());

    let (tx, rx) = oneshot::channel();
    let registry: Weak<OperationRegistry> = Arc::downgrade(registry);
    let task_token = token.clone();

    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = task_token.cancelled() => Err(ContainerError::Cancelled),
            result = work => result,
        };

        let tracked = registry
            .upgrade()
            .is_some_and(|registry| registry.complete_and_remove(handle));
        let outcome = if tracked {
            result.and_then(apply)
        } else {
            Err(ContainerError::Cancelled)
        };

        match &outcome {
            Ok(_) => trace!(target = "applet.ops", %handle, kind = kind.as_str(), "operation completed"),
            Err(ContainerError::Cancelled) => {
                debug!(target = "applet.ops", %handle, kind = kind.as_str(), "operation finished cancelled")
            }
            Err(err) => {
                warn!(target = "applet.ops", %handle, kind = kind.as_str(), error = %err, "operation failed")
            }
        }
        let _ = tx.send(outcome);
    });

    PendingOperation {
        handle,
        kind,
        token,
        outcome: rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[test]
    fn cancel_of_unknown_handle_is_a_no_op() {
        let registry = OperationRegistry::new();
        let handle = registry.next_handle();
        assert!(!registry.cancel(handle));
        assert!(!registry.complete_and_remove(handle));
    }

    #[test]
    fn removal_happens_once() {
        let registry = OperationRegistry::new();
        let handle = registry.next_handle();
        let token = CancellationToken::new();
        registry.register(handle, OperationKind::SetProperty, token.clone());
        assert_eq!(registry.pending(), vec![(handle, OperationKind::SetProperty)]);

        assert!(registry.complete_and_remove(handle));
        assert!(!registry.cancel(handle));
        assert!(!token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_drains_and_cancels_tokens() {
        let registry = OperationRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|_| {
                let token = CancellationToken::new();
                registry.register(registry.next_handle(), OperationKind::GetProperty, token.clone());
                token
            })
            .collect();

        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert_eq!(registry.cancel_all(), 0);
    }

    #[tokio::test]
    async fn tracked_operation_completes_and_leaves_registry() {
        let registry = Arc::new(OperationRegistry::new());
        let parent = CancellationToken::new();
        let op = spawn_tracked(
            &registry,
            OperationKind::GetProperty,
            &parent,
            async { Ok(21u32) },
            |value| Ok(value * 2),
        );
        assert!(registry.contains(op.handle()));

        let value = tokio::time::timeout(Duration::from_secs(1), op)
            .await
            .expect("completes in time");
        assert_eq!(value, Ok(42));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_operation_skips_continuation() {
        let registry = Arc::new(OperationRegistry::new());
        let parent = CancellationToken::new();
        let release = Arc::new(Notify::new());
        let applied = Arc::new(AtomicBool::new(false));

        let gate = release.clone();
        let flag = applied.clone();
        let op = spawn_tracked(
            &registry,
            OperationKind::SetProperty,
            &parent,
            async move {
                gate.notified().await;
                Ok(())
            },
            move |()| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        );

        assert!(registry.cancel(op.handle()));
        release.notify_one();

        let outcome = tokio::time::timeout(Duration::from_secs(1), op)
            .await
            .expect("completes in time");
        assert_eq!(outcome, Err(ContainerError::Cancelled));
        assert!(!applied.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn parent_token_cancels_operation() {
        let registry = Arc::new(OperationRegistry::new());
        let parent = CancellationToken::new();
        let op = spawn_tracked(
            &registry,
            OperationKind::PopupMenu,
            &parent,
            std::future::pending::<ContainerResult<()>>(),
            Ok,
        );

        parent.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), op)
            .await
            .expect("completes in time");
        assert_eq!(outcome, Err(ContainerError::Cancelled));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failures_are_delivered_to_the_caller() {
        let registry = Arc::new(OperationRegistry::new());
        let op = spawn_tracked(
            &registry,
            OperationKind::GetProperty,
            &CancellationToken::new(),
            async { Err::<(), _>(ContainerError::NotReady) },
            Ok,
        );
        assert_eq!(op.await, Err(ContainerError::NotReady));
        assert!(registry.is_empty());
    }
}
