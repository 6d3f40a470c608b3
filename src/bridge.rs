//! Bridging between plain OS threads and the async runtime.
//!
//! Two directions are covered: scheduling async work onto the runtime from a
//! thread that is not part of it ([`RuntimeBridge::call_soon`]), and running
//! blocking work from async code without stalling the executor
//! ([`run_in_thread`]).

use std::future::Future;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Failure modes of the thread bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The offloaded closure panicked or its task was aborted.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A captured handle to a tokio runtime, usable from any thread.
///
/// Capturing is non-blocking: [`RuntimeBridge::current`] succeeds only when
/// called from within a runtime. Tokens and operations capture a bridge at
/// their first async observation so that later synchronous cancels can
/// marshal work back onto the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeBridge {
    handle: Handle,
}

impl RuntimeBridge {
    /// Capture the runtime the caller is currently running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self { handle })
    }

    /// Wrap an explicit runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// The underlying runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Schedule a future onto the runtime from any thread.
    ///
    /// The returned handle may be awaited or dropped; dropping it does not
    /// cancel the scheduled work.
    pub fn call_soon<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Run a future to completion from a non-async thread.
    ///
    /// Must not be called from within the runtime itself; tokio panics on
    /// nested `block_on`.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

/// Offload blocking work to the runtime's worker thread pool and await it.
///
/// The await point is cancellable: dropping the returned future detaches the
/// blocking closure, which runs to completion on its pool thread. Cooperative
/// cancellation inside the closure is the caller's responsibility (pass a
/// [`crate::token::CancelToken`] in and `check()` it).
pub async fn run_in_thread<F, T>(f: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}
