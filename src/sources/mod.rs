//! Cancellation sources: background-monitored triggers that cancel the
//! operation they are installed in.
//!
//! Every source follows the same contract: it is activated into exactly one
//! operation, spawns whatever monitoring it needs, marks itself `triggered`
//! when it fires, and cleans up all runtime resources on deactivation.
//! Deactivation is idempotent; activation is one-shot: re-activating a
//! source (or activating it into a second scope) fails fast.
//!
//! A monitor task that fails is reported through the operation's error
//! callbacks and the log, and the operation continues without that source.
//! Monitor failures never cancel the operation.

mod composite;
mod deadline;
mod predicate;
mod signal;
mod token;

pub use composite::{AllOfSource, AnyOfSource};
pub use deadline::DeadlineSource;
pub use predicate::PredicateSource;
pub use signal::SignalSource;
pub use token::TokenSource;

use crate::error::UsageError;
use crate::events::{CallbackSet, OperationEvent, dispatch};
use crate::token::CancelToken;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// The slice of an operation a source needs while active: the token to fire,
/// the operation id for logs, and a path to the error callbacks.
#[derive(Clone)]
pub struct SourceScope {
    operation_id: String,
    token: CancelToken,
    callbacks: Arc<Mutex<CallbackSet>>,
}

impl SourceScope {
    pub(crate) fn new(
        operation_id: String,
        token: CancelToken,
        callbacks: Arc<Mutex<CallbackSet>>,
    ) -> Self {
        Self {
            operation_id,
            token,
            callbacks,
        }
    }

    /// Id of the operation this source is installed in.
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// The token the source fires on trigger.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// The same scope with the token swapped out. Composite sources use this
    /// to interpose their own intermediate tokens between child and operation.
    pub fn with_token(&self, token: CancelToken) -> Self {
        Self {
            operation_id: self.operation_id.clone(),
            token,
            callbacks: Arc::clone(&self.callbacks),
        }
    }

    /// Surface a monitor failure to the operation's error callbacks.
    pub async fn report_failure(&self, source: &str, error: &str) {
        tracing::warn!(
            operation_id = %self.operation_id,
            source,
            "cancellation source failed: {error}"
        );
        let sinks = {
            let callbacks = self.callbacks.lock().expect("callback lock poisoned");
            callbacks.error.clone()
        };
        let event = OperationEvent::SourceFailed {
            operation_id: self.operation_id.clone(),
            source: source.to_string(),
            error: error.to_string(),
        };
        dispatch(&sinks, &event).await;
    }
}

/// A trigger that cancels its enclosing operation when it fires.
#[async_trait]
pub trait CancelSource: Send + Sync {
    /// Human-readable description used in logs and trigger messages.
    fn description(&self) -> String;

    /// True once this source has fired.
    fn triggered(&self) -> bool;

    /// Attach to an operation and start monitoring. One-shot: activating a
    /// source twice, or into a second scope, is a usage error.
    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError>;

    /// Stop monitoring and release all runtime resources. Idempotent.
    async fn deactivate(&self);

    /// Deadline sources activate before all others on operation entry.
    fn is_deadline(&self) -> bool {
        false
    }
}

/// A background monitor owned by a source: a spawned task plus the stop
/// token used to shut it down cooperatively.
pub(crate) struct MonitorTask {
    stop: tokio_util::sync::CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorTask {
    /// Spawn a monitor. The closure receives the stop token and must return
    /// promptly once it fires.
    pub(crate) fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(tokio_util::sync::CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let stop = tokio_util::sync::CancellationToken::new();
        let handle = tokio::spawn(f(stop.clone()));
        Self { stop, handle }
    }

    /// Cooperatively stop the monitor and wait for it to finish.
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await
            && !err.is_cancelled()
        {
            tracing::warn!("monitor task ended abnormally: {err}");
        }
    }
}

/// State shared by every source implementation: activation latch, trigger
/// flag, and the monitors to stop on deactivation.
pub(crate) struct SourceCore {
    description: String,
    activated: AtomicBool,
    triggered: Arc<AtomicBool>,
    monitors: Mutex<Vec<MonitorTask>>,
}

impl SourceCore {
    pub(crate) fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            activated: AtomicBool::new(false),
            triggered: Arc::new(AtomicBool::new(false)),
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Shared flag handed to monitor tasks so they can mark the trigger.
    pub(crate) fn triggered_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.triggered)
    }

    /// Latch activation. The latch never resets: a source is consumed by the
    /// scope that activated it.
    pub(crate) fn try_activate(&self) -> Result<(), UsageError> {
        if self.activated.swap(true, Ordering::AcqRel) {
            return Err(UsageError::SourceAlreadyActive(self.description.clone()));
        }
        Ok(())
    }

    pub(crate) fn push_monitor(&self, task: MonitorTask) {
        self.monitors
            .lock()
            .expect("monitor lock poisoned")
            .push(task);
    }

    /// Stop all monitors, most recently installed first. Idempotent: the
    /// second call finds nothing to stop.
    pub(crate) async fn stop_monitors(&self) {
        let mut tasks: Vec<MonitorTask> = {
            let mut monitors = self.monitors.lock().expect("monitor lock poisoned");
            monitors.drain(..).collect()
        };
        while let Some(task) = tasks.pop() {
            task.stop().await;
        }
    }
}
