//! Cancellation scopes and abortable request futures
//!
//! Every request gets a parent [`AbortScope`] (a child of the engine's
//! root token) that bounds the total timeout and caller-initiated aborts.
//! Each attempt may get a further child scope for the per-attempt timeout.
//! Cancelling a parent cascades to its children; a child firing never
//! collapses the parent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::response::FetchResponse;

/// A cancellation scope with an optional armed timeout
///
/// Clones share the same token, timed-out flag, and timer; the scope is
/// cheap to pass into spawned tasks.
#[derive(Clone)]
pub struct AbortScope {
    token: CancellationToken,
    timer_fired: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AbortScope {
    /// Scope whose token is a child of `parent`
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            timer_fired: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
            timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Child scope of this scope (per-attempt timeout)
    pub fn child(&self) -> Self {
        Self::child_of(&self.token)
    }

    /// Arm the scope's timer: after `timeout`, mark timed-out and cancel.
    /// The timer task exits early if the scope is cancelled first.
    pub fn arm(&self, timeout: Duration) {
        let token = self.token.clone();
        let fired = self.timer_fired.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;

                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    fired.store(true, Ordering::SeqCst);
                    token.cancel();
                }
            }
        });
        let mut timer = self.timer.lock().expect("abort timer poisoned");
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the armed timer without cancelling the scope
    pub fn disarm(&self) {
        if let Some(handle) = self.timer.lock().expect("abort timer poisoned").take() {
            handle.abort();
        }
    }

    /// Propagate an external caller-owned token into this scope
    pub fn link(&self, external: &CancellationToken) {
        let external = external.clone();
        let scope = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = scope.token.cancelled() => {}
                () = external.cancelled() => scope.cancel(None),
            }
        });
    }

    /// Cancel manually (does not set the timed-out flag)
    pub fn cancel(&self, reason: Option<String>) {
        if let Some(reason) = reason {
            *self.reason.lock().expect("abort reason poisoned") = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True when cancellation came from the armed timer
    pub fn timer_fired(&self) -> bool {
        self.timer_fired.load(Ordering::SeqCst)
    }

    /// Caller-supplied abort reason, if any
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("abort reason poisoned").clone()
    }

    /// The underlying token, for select arms and transport calls
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the scope is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Cloneable control handle for an in-flight request
#[derive(Clone)]
pub struct AbortHandle {
    scope: AbortScope,
    finished: Arc<AtomicBool>,
}

impl AbortHandle {
    pub(crate) fn new(scope: AbortScope) -> Self {
        Self {
            scope,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the request, optionally recording a reason
    pub fn abort(&self, reason: Option<String>) {
        self.scope.cancel(reason);
    }

    /// Whether the request has been aborted (manually or by timeout)
    pub fn is_aborted(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Whether the request future has produced its outcome
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

/// A request future that can be aborted through its handle
///
/// Awaiting yields the terminal outcome; `handle()` returns a cloneable
/// control handle usable from other tasks.
pub struct Abortable {
    future: BoxFuture<'static, Result<FetchResponse, FetchError>>,
    handle: AbortHandle,
}

impl Abortable {
    pub(crate) fn new(
        future: BoxFuture<'static, Result<FetchResponse, FetchError>>,
        handle: AbortHandle,
    ) -> Self {
        Self { future, handle }
    }

    /// Cloneable control handle
    pub fn handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    /// Abort the request, optionally recording a reason
    pub fn abort(&self, reason: Option<String>) {
        self.handle.abort(reason);
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for Abortable {
    type Output = Result<FetchResponse, FetchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.future.as_mut().poll(cx) {
            Poll::Ready(outcome) => {
                this.handle.mark_finished();
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_sets_timed_out_and_cancels() {
        let root = CancellationToken::new();
        let scope = AbortScope::child_of(&root);
        scope.arm(Duration::from_millis(50));

        scope.cancelled().await;
        assert!(scope.is_cancelled());
        assert!(scope.timer_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_cancel_does_not_set_timed_out() {
        let root = CancellationToken::new();
        let scope = AbortScope::child_of(&root);
        scope.arm(Duration::from_secs(60));

        scope.cancel(Some("caller".to_string()));
        scope.cancelled().await;
        assert!(!scope.timer_fired());
        assert_eq!(scope.reason(), Some("caller".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_cascades_to_child() {
        let root = CancellationToken::new();
        let parent = AbortScope::child_of(&root);
        let child = parent.child();

        parent.cancel(None);
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_timeout_does_not_collapse_parent() {
        let root = CancellationToken::new();
        let parent = AbortScope::child_of(&root);
        let child = parent.child();
        child.arm(Duration::from_millis(10));

        child.cancelled().await;
        assert!(child.timer_fired());
        assert!(!parent.is_cancelled());
        assert!(!parent.timer_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_external_token_aborts_scope() {
        let root = CancellationToken::new();
        let scope = AbortScope::child_of(&root);
        let external = CancellationToken::new();
        scope.link(&external);

        external.cancel();
        scope.cancelled().await;
        assert!(!scope.timer_fired());
    }
}
