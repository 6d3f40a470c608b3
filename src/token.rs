//! Thread-safe one-shot cancellation tokens.
//!
//! A [`CancelToken`] is the signal through which every cancellation in this
//! crate is expressed. It is cheap to clone (all clones share state), can be
//! fired from async tasks or plain OS threads, records *why* it fired, and
//! wakes every waiter exactly once. Tokens are one-shot: the first cancel wins
//! and later calls are no-ops.
//!
//! Linked tokens ([`CancelToken::linked`]) fire when any of their parents
//! fire, recording which parent propagated.

use crate::bridge::RuntimeBridge;
use crate::error::CancelError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Why a cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A deadline passed.
    Timeout,
    /// Someone called `cancel` explicitly.
    Manual,
    /// An OS signal arrived.
    Signal,
    /// A monitored predicate held true.
    Condition,
    /// The parent operation was cancelled.
    Parent,
    /// A cancellation source itself failed.
    Error,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CancelReason::Timeout => "timeout",
            CancelReason::Manual => "manual",
            CancelReason::Signal => "signal",
            CancelReason::Condition => "condition",
            CancelReason::Parent => "parent",
            CancelReason::Error => "error",
        };
        f.write_str(text)
    }
}

enum TokenCallback {
    Sync(Box<dyn Fn(&CancelError) + Send + Sync>),
    Async(Box<dyn Fn(CancelError) -> BoxFuture<'static, ()> + Send + Sync>),
}

struct TokenState {
    reason: Option<CancelReason>,
    message: Option<String>,
    fired_at: Option<DateTime<Utc>>,
    callbacks: Vec<TokenCallback>,
    runtime: Option<RuntimeBridge>,
}

struct TokenShared {
    cancelled: AtomicBool,
    /// Wake primitive for `wait()`. Thread-safe, so a cancel from a plain OS
    /// thread wakes async waiters without marshalling.
    waiters: tokio_util::sync::CancellationToken,
    state: Mutex<TokenState>,
    origin: String,
}

/// A cloneable, thread-safe, one-shot cancellation signal.
///
/// All clones share the same underlying state; cancelling one makes every
/// clone observe `is_cancelled() == true`. The reason and message recorded by
/// the first successful cancel are immutable afterwards.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<TokenShared>,
}

impl CancelToken {
    /// Create a new token that is not cancelled.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TokenShared {
                cancelled: AtomicBool::new(false),
                waiters: tokio_util::sync::CancellationToken::new(),
                state: Mutex::new(TokenState {
                    reason: None,
                    message: None,
                    fired_at: None,
                    callbacks: Vec::new(),
                    runtime: None,
                }),
                origin: uuid::Uuid::new_v4().to_string(),
            }),
        }
    }

    /// Create a token that fires when any of `parents` fires.
    ///
    /// The child records the propagating parent's reason and message, plus a
    /// note naming the parent's origin id. Parents hold no strong reference
    /// to the child, so dropping the child does not leak.
    pub fn linked(parents: &[CancelToken]) -> CancelToken {
        let child = CancelToken::new();
        for parent in parents {
            let weak: Weak<TokenShared> = Arc::downgrade(&child.shared);
            let parent_origin = parent.origin().to_string();
            parent.register_callback(move |err: &CancelError| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let token = CancelToken { shared };
                token.cancel_sync_with(
                    err.reason,
                    format!("{} (linked from token {})", err.message, parent_origin),
                );
            });
        }
        child
    }

    /// Stable identifier used when linked tokens report which parent fired.
    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    /// True once the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// The recorded reason, present once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.lock_state().reason
    }

    /// The recorded message, present once cancelled.
    pub fn message(&self) -> Option<String> {
        self.lock_state().message.clone()
    }

    /// When the token fired.
    pub fn fired_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().fired_at
    }

    /// Cancel with reason [`CancelReason::Manual`]. Returns `false` when the
    /// token was already cancelled.
    pub async fn cancel(&self, message: impl Into<String>) -> bool {
        self.cancel_with(CancelReason::Manual, message).await
    }

    /// Cancel with an explicit reason. Idempotent: the first call records the
    /// reason and message, wakes waiters, and runs callbacks in registration
    /// order (async callbacks awaited sequentially); later calls return
    /// `false` without side effects.
    pub async fn cancel_with(&self, reason: CancelReason, message: impl Into<String>) -> bool {
        self.bind_runtime();
        let Some(callbacks) = self.try_fire(reason, message.into()) else {
            return false;
        };
        self.shared.waiters.cancel();
        let err = self.fired_error();
        for cb in callbacks {
            match cb {
                TokenCallback::Sync(f) => f(&err),
                TokenCallback::Async(f) => f(err.clone()).await,
            }
        }
        true
    }

    /// Cancel from any thread, async runtime or not.
    ///
    /// The atomic transition and waiter wake happen on the calling thread.
    /// Async callbacks are marshalled onto the runtime the token is bound to;
    /// when no runtime has been observed yet they are dropped with a warning,
    /// and waiters still observe the cancellation at their next poll.
    pub fn cancel_sync(&self, message: impl Into<String>) -> bool {
        self.cancel_sync_with(CancelReason::Manual, message)
    }

    /// [`CancelToken::cancel_sync`] with an explicit reason.
    pub fn cancel_sync_with(&self, reason: CancelReason, message: impl Into<String>) -> bool {
        let Some(callbacks) = self.try_fire(reason, message.into()) else {
            return false;
        };
        self.shared.waiters.cancel();
        let err = self.fired_error();
        let mut deferred = Vec::new();
        for cb in callbacks {
            match cb {
                TokenCallback::Sync(f) => f(&err),
                TokenCallback::Async(f) => deferred.push(f(err.clone())),
            }
        }
        if !deferred.is_empty() {
            let runtime = self.lock_state().runtime.clone();
            match runtime {
                Some(bridge) => {
                    bridge.call_soon(async move {
                        for fut in deferred {
                            fut.await;
                        }
                    });
                }
                None => {
                    tracing::warn!(
                        origin = %self.shared.origin,
                        "cancel_sync dropped {} async callback(s): no runtime bound",
                        deferred.len()
                    );
                }
            }
        }
        true
    }

    /// Synchronous cancellation observation point.
    ///
    /// Returns the reason-tagged [`CancelError`] once cancelled.
    pub fn check(&self) -> Result<(), CancelError> {
        if self.is_cancelled() {
            Err(self.fired_error())
        } else {
            Ok(())
        }
    }

    /// Async observation point: yields to the scheduler, then checks.
    ///
    /// The yield makes this a genuine suspension point, so a task spinning on
    /// `check_async` stays cooperative.
    pub async fn check_async(&self) -> Result<(), CancelError> {
        self.bind_runtime();
        tokio::task::yield_now().await;
        self.check()
    }

    /// Resolve once the token is cancelled.
    ///
    /// Resolves immediately when already cancelled, including when the cancel
    /// happened on another thread before any waiter existed.
    pub async fn wait(&self) {
        self.bind_runtime();
        self.shared.waiters.cancelled().await;
    }

    /// Register a synchronous callback fired on cancellation.
    ///
    /// When the token is already cancelled the callback runs immediately on
    /// the calling thread with the recorded reason and message.
    pub fn register_callback(&self, f: impl Fn(&CancelError) + Send + Sync + 'static) {
        let mut state = self.shared.state.lock().expect("token state lock poisoned");
        if self.shared.cancelled.load(Ordering::Acquire) {
            let err = Self::error_from(&state);
            drop(state);
            f(&err);
        } else {
            state.callbacks.push(TokenCallback::Sync(Box::new(f)));
        }
    }

    /// Register an async callback fired on cancellation.
    ///
    /// When the token is already cancelled the callback is awaited inline.
    pub async fn register_async_callback<F, Fut>(&self, f: F)
    where
        F: Fn(CancelError) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut callback = Some(f);
        let fire_now = {
            let mut state = self.shared.state.lock().expect("token state lock poisoned");
            if self.shared.cancelled.load(Ordering::Acquire) {
                Some(Self::error_from(&state))
            } else {
                if let Some(f) = callback.take() {
                    state
                        .callbacks
                        .push(TokenCallback::Async(Box::new(move |err| Box::pin(f(err)))));
                }
                None
            }
        };
        if let (Some(err), Some(f)) = (fire_now, callback) {
            f(err).await;
        }
    }

    /// Capture the current runtime handle if none is bound yet.
    ///
    /// Called on the first async observation and at operation entry, so a
    /// later `cancel_sync` from a foreign thread can marshal async callbacks.
    pub(crate) fn bind_runtime(&self) {
        let Some(bridge) = RuntimeBridge::current() else {
            return;
        };
        let mut state = self.shared.state.lock().expect("token state lock poisoned");
        if state.runtime.is_none() {
            state.runtime = Some(bridge);
        }
    }

    /// Attempt the one-shot false→true transition. On success, records the
    /// reason and message and returns the drained callback list; the caller
    /// invokes callbacks outside the lock. Draining also breaks any reference
    /// cycles held through registered callbacks.
    fn try_fire(&self, reason: CancelReason, message: String) -> Option<Vec<TokenCallback>> {
        if self.is_cancelled() {
            return None;
        }
        let mut state = self.shared.state.lock().expect("token state lock poisoned");
        if self.shared.cancelled.load(Ordering::Acquire) {
            return None;
        }
        state.reason = Some(reason);
        state.message = Some(message);
        state.fired_at = Some(Utc::now());
        self.shared.cancelled.store(true, Ordering::Release);
        Some(std::mem::take(&mut state.callbacks))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TokenState> {
        self.shared.state.lock().expect("token state lock poisoned")
    }

    fn fired_error(&self) -> CancelError {
        Self::error_from(&self.lock_state())
    }

    fn error_from(state: &TokenState) -> CancelError {
        CancelError::new(
            state.reason.unwrap_or(CancelReason::Manual),
            state.message.clone().unwrap_or_default(),
        )
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("origin", &self.shared.origin)
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_is_one_shot() {
        let token = CancelToken::new();
        assert!(token.cancel_with(CancelReason::Timeout, "first").await);
        assert!(!token.cancel_with(CancelReason::Manual, "second").await);
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
        assert_eq!(token.message().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn check_reports_reason() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel_with(CancelReason::Signal, "sigint").await;
        let err = token.check().unwrap_err();
        assert_eq!(err.reason, CancelReason::Signal);
        assert_eq!(err.message, "sigint");
    }

    #[tokio::test]
    async fn wait_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop").await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_sync_from_thread_wakes_async_waiter() {
        let token = CancelToken::new();
        let observer = token.clone();
        let waiter = tokio::spawn(async move {
            observer.wait().await;
            observer.reason()
        });

        let thread_token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            assert!(thread_token.cancel_sync("user"));
        });

        let reason = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("cross-thread cancel should wake waiter")
            .unwrap();
        assert_eq!(reason, Some(CancelReason::Manual));
        assert_eq!(token.message().as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn cancel_before_any_waiter_is_observed_immediately() {
        let token = CancelToken::new();
        let thread_token = token.clone();
        std::thread::spawn(move || thread_token.cancel_sync("early"))
            .join()
            .unwrap();
        // First wait after a foreign-thread cancel must resolve at once.
        tokio::time::timeout(Duration::from_millis(100), token.wait())
            .await
            .expect("wait should resolve immediately");
        assert!(token.check_async().await.is_err());
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order() {
        let token = CancelToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        token.register_callback(move |_| o.lock().unwrap().push(1));
        let o = order.clone();
        token
            .register_async_callback(move |_| {
                let o = o.clone();
                async move {
                    o.lock().unwrap().push(2);
                }
            })
            .await;
        let o = order.clone();
        token.register_callback(move |_| o.lock().unwrap().push(3));

        token.cancel("done").await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_callback_fires_immediately_with_recorded_reason() {
        let token = CancelToken::new();
        token.cancel_with(CancelReason::Condition, "met").await;

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        token.register_callback(move |err| {
            *s.lock().unwrap() = Some((err.reason, err.message.clone()));
        });
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((CancelReason::Condition, "met".to_string()))
        );
    }

    #[tokio::test]
    async fn linked_token_propagates_first_parent() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let linked = CancelToken::linked(&[a.clone(), b.clone()]);

        assert!(!linked.is_cancelled());
        a.cancel_with(CancelReason::Timeout, "expired").await;
        assert!(linked.is_cancelled());
        assert_eq!(linked.reason(), Some(CancelReason::Timeout));
        let message = linked.message().unwrap();
        assert!(message.contains("expired"));
        assert!(message.contains(a.origin()), "message should name the parent");

        // The second parent firing is a no-op on the already-cancelled child.
        b.cancel("late").await;
        assert_eq!(linked.reason(), Some(CancelReason::Timeout));
    }

    #[tokio::test]
    async fn linked_token_from_already_cancelled_parent() {
        let parent = CancelToken::new();
        parent.cancel("gone").await;
        let linked = CancelToken::linked(&[parent]);
        assert!(linked.is_cancelled());
    }

    #[tokio::test]
    async fn callbacks_are_drained_after_fire() {
        let token = CancelToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.register_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel("once").await;
        // A second cancel must not re-run drained callbacks.
        token.cancel("twice").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
