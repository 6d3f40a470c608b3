//! Scoped cancellable operations.
//!
//! An [`Operation`] wraps a region of async work with an identity, a
//! [`CancelToken`], a set of cancellation sources, lifecycle callbacks, and
//! optional registration in the process-wide registry. [`Operation::run`]
//! drives the body: on entry it activates sources and publishes the ambient
//! context; while running it races the body against the token; on exit it
//! always deactivates sources, settles children, fires callbacks, and
//! unregisters, whether the body completed, failed, or was cancelled.
//!
//! Cancellation delivery is cooperative and runtime-native: once the token
//! fires, the body future is dropped at its next suspension point, so `Drop`
//! implementations run exactly like cleanup blocks. A body that never
//! suspends cannot be cancelled this way; tight loops should call
//! [`Operation::checkpoint`] or use [`Operation::wrap`].

use crate::context::CURRENT_OPERATION;
use crate::error::{CancelError, RunError, UsageError};
use crate::events::{CallbackSet, EventSink, Metadata, OperationEvent, dispatch};
use crate::registry::{OperationRegistry, global_registry};
use crate::sources::{CancelSource, DeadlineSource, PredicateSource, SourceScope};
#[cfg(unix)]
use crate::sources::SignalSource;
use crate::token::{CancelReason, CancelToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

/// How long a parent waits for each live child to finish after cancelling it.
pub const DEFAULT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Constructed, not yet entered.
    Pending,
    /// Inside its scope.
    Running,
    /// Inside its scope, with a shield guard held.
    Shielded,
    /// Exited without cancellation or error.
    Completed,
    /// Exited because its token fired.
    Cancelled,
    /// Exited with a non-cancellation error.
    Failed,
}

impl OperationStatus {
    /// True while the operation has not reached a terminal state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::Running | OperationStatus::Shielded
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Shielded => "shielded",
            OperationStatus::Completed => "completed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Intermediate data preserved through cancellation, fed by buffered stream
/// wrappers or explicit [`Operation::record_partial`] calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PartialResult {
    pub items: Vec<Value>,
    pub count: u64,
}

impl PartialResult {
    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.items.is_empty()
    }
}

/// Point-in-time copy of an operation's observable state, as returned by the
/// registry. Snapshots are independent: they never hold the operation alive
/// and never change after being taken.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub status: OperationStatus,
    pub reason: Option<CancelReason>,
    pub message: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

struct Lifecycle {
    status: OperationStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

struct OperationInner {
    id: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    token: CancelToken,
    sources: Vec<Arc<dyn CancelSource>>,
    parent: Option<Weak<OperationInner>>,
    children: Mutex<Vec<Weak<OperationInner>>>,
    callbacks: Arc<Mutex<CallbackSet>>,
    metadata: Mutex<Metadata>,
    partial: Mutex<PartialResult>,
    lifecycle: Mutex<Lifecycle>,
    registry: OperationRegistry,
    register_globally: bool,
    shutdown_budget: Duration,
    shield_depth: AtomicUsize,
    shield_release: tokio::sync::Notify,
    /// Set when a checkpoint, progress report, or wrapped call observed the
    /// fired token; lets exit classify a body error as propagated
    /// cancellation rather than failure.
    cancel_observed: AtomicBool,
    /// Fired once exit has fully completed; parents wait on this.
    finished: tokio_util::sync::CancellationToken,
}

/// A scoped cancellable unit of async work. Cheap to clone; all clones refer
/// to the same operation.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

/// Configures and creates an [`Operation`].
pub struct OperationBuilder {
    id: Option<String>,
    name: Option<String>,
    parent: Option<Operation>,
    token: Option<CancelToken>,
    sources: Vec<Box<dyn CancelSource>>,
    metadata: Metadata,
    register_globally: bool,
    registry: Option<OperationRegistry>,
    shutdown_budget: Duration,
}

impl OperationBuilder {
    fn new() -> Self {
        Self {
            id: None,
            name: None,
            parent: None,
            token: None,
            sources: Vec::new(),
            metadata: Metadata::new(),
            register_globally: true,
            registry: None,
            shutdown_budget: DEFAULT_SHUTDOWN_BUDGET,
        }
    }

    /// Explicit operation id; a UUID is generated when absent.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Human name used in logs and glob-based registry filters.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Nest under `parent`: the child is cancelled when the parent is.
    pub fn parent(mut self, parent: &Operation) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Use `token` as the operation's own token instead of creating one.
    pub fn token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Install a cancellation source; may be called repeatedly.
    pub fn source(mut self, source: impl CancelSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether to appear in the registry while running (default: yes).
    pub fn register_globally(mut self, register: bool) -> Self {
        self.register_globally = register;
        self
    }

    /// Register in a specific registry instead of the process-wide one.
    /// Useful for test isolation.
    pub fn registry(mut self, registry: &OperationRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// How long to wait for each child on parent cancellation.
    pub fn shutdown_budget(mut self, budget: Duration) -> Self {
        self.shutdown_budget = budget;
        self
    }

    pub fn build(self) -> Operation {
        Operation {
            inner: Arc::new(OperationInner {
                id: self
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: self.name,
                created_at: Utc::now(),
                token: self.token.unwrap_or_default(),
                sources: self.sources.into_iter().map(Arc::from).collect(),
                parent: self
                    .parent
                    .map(|parent| Arc::downgrade(&parent.inner)),
                children: Mutex::new(Vec::new()),
                callbacks: Arc::new(Mutex::new(CallbackSet::default())),
                metadata: Mutex::new(self.metadata),
                partial: Mutex::new(PartialResult::default()),
                lifecycle: Mutex::new(Lifecycle {
                    status: OperationStatus::Pending,
                    started_at: None,
                    ended_at: None,
                }),
                registry: self.registry.unwrap_or_else(global_registry),
                register_globally: self.register_globally,
                shutdown_budget: self.shutdown_budget,
                shield_depth: AtomicUsize::new(0),
                shield_release: tokio::sync::Notify::new(),
                cancel_observed: AtomicBool::new(false),
                finished: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }
}

enum ExitKind {
    Completed,
    Cancelled,
    Failed(String),
}

enum BodyOutcome<T, E> {
    Finished(Result<T, E>),
    Cancelled,
}

impl Operation {
    pub fn builder() -> OperationBuilder {
        OperationBuilder::new()
    }

    /// Operation cancelled when `duration` elapses.
    pub fn with_deadline(duration: Duration) -> OperationBuilder {
        Self::builder().source(DeadlineSource::after(duration))
    }

    /// Operation sharing an externally owned token.
    pub fn with_token(token: CancelToken) -> OperationBuilder {
        Self::builder().token(token)
    }

    /// Operation cancelled when the predicate holds.
    pub fn with_predicate(
        predicate: impl Fn() -> bool + Send + Sync + 'static,
        interval: Duration,
    ) -> Result<OperationBuilder, UsageError> {
        Ok(Self::builder().source(PredicateSource::new(predicate, interval)?))
    }

    /// Operation cancelled on any of the given OS signals.
    #[cfg(unix)]
    pub fn with_signals(kinds: impl IntoIterator<Item = SignalKind>) -> OperationBuilder {
        Self::builder().source(SignalSource::new(kinds))
    }

    /// Operation with an explicit list of sources.
    pub fn with_sources(sources: Vec<Box<dyn CancelSource>>) -> OperationBuilder {
        let mut builder = Self::builder();
        builder.sources = sources;
        builder
    }

    /// Operation whose token fires when either this operation's token or
    /// `other`'s fires. Children may be nested under the combined scope.
    pub fn combine(&self, other: &Operation) -> OperationBuilder {
        Self::builder().token(CancelToken::linked(&[
            self.inner.token.clone(),
            other.inner.token.clone(),
        ]))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn token(&self) -> &CancelToken {
        &self.inner.token
    }

    pub fn status(&self) -> OperationStatus {
        self.lock_lifecycle().status
    }

    /// The recorded cancellation reason, once the token has fired.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.token.reason()
    }

    /// The recorded cancellation message, once the token has fired.
    pub fn message(&self) -> Option<String> {
        self.inner.token.message()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock_lifecycle().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock_lifecycle().ended_at
    }

    /// Elapsed scope time: end minus start once exited, otherwise running
    /// time so far. `None` before entry.
    pub fn duration(&self) -> Option<Duration> {
        let lifecycle = self.lock_lifecycle();
        match (lifecycle.started_at, lifecycle.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            (Some(start), None) => (Utc::now() - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn parent_id(&self) -> Option<String> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|parent| parent.id.clone())
    }

    /// Live children, in creation order.
    pub fn children(&self) -> Vec<Operation> {
        self.inner
            .children
            .lock()
            .expect("children lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Operation { inner })
            .collect()
    }

    pub fn metadata(&self) -> Metadata {
        self.inner
            .metadata
            .lock()
            .expect("metadata lock poisoned")
            .clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner
            .metadata
            .lock()
            .expect("metadata lock poisoned")
            .insert(key.into(), value);
    }

    /// Append one intermediate item, preserved through cancellation.
    pub fn record_partial(&self, value: Value) {
        let mut partial = self.inner.partial.lock().expect("partial lock poisoned");
        partial.items.push(value);
        partial.count += 1;
    }

    pub fn partial_result(&self) -> PartialResult {
        self.inner
            .partial
            .lock()
            .expect("partial lock poisoned")
            .clone()
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let lifecycle = self.lock_lifecycle();
        OperationSnapshot {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            status: lifecycle.status,
            reason: self.inner.token.reason(),
            message: self.inner.token.message(),
            parent_id: self.parent_id(),
            created_at: self.inner.created_at,
            started_at: lifecycle.started_at,
            ended_at: lifecycle.ended_at,
            metadata: self.metadata(),
        }
    }

    /// Register a progress callback. Duplicates are allowed; invocation is in
    /// registration order. Progress reports do not bubble to parents.
    pub fn on_progress(&self, sink: Arc<dyn EventSink>) -> &Self {
        self.lock_callbacks().progress.push(sink);
        self
    }

    pub fn on_start(&self, sink: Arc<dyn EventSink>) -> &Self {
        self.lock_callbacks().start.push(sink);
        self
    }

    pub fn on_complete(&self, sink: Arc<dyn EventSink>) -> &Self {
        self.lock_callbacks().complete.push(sink);
        self
    }

    pub fn on_cancel(&self, sink: Arc<dyn EventSink>) -> &Self {
        self.lock_callbacks().cancel.push(sink);
        self
    }

    /// Register an error callback, fired on body failure and on source
    /// monitor failures.
    pub fn on_error(&self, sink: Arc<dyn EventSink>) -> &Self {
        self.lock_callbacks().error.push(sink);
        self
    }

    /// Drive `body` inside this operation's scope.
    ///
    /// Enters the scope, publishes the ambient context, races the body
    /// against the token, then exits: sources deactivate, live children are
    /// cancelled and awaited within the shutdown budget, callbacks fire, and
    /// the registry entry moves to history. The body's own error comes back
    /// unchanged in [`RunError::Failed`].
    pub async fn run<T, E, F>(&self, body: F) -> Result<T, RunError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.enter().await?;
        let mut guard = AbandonGuard {
            op: Some(self.clone()),
        };

        let outcome = CURRENT_OPERATION
            .scope(self.clone(), async {
                tokio::pin!(body);
                tokio::select! {
                    biased;
                    _ = self.cancel_delivered() => BodyOutcome::Cancelled,
                    result = &mut body => BodyOutcome::Finished(result),
                }
            })
            .await;
        guard.disarm();

        match outcome {
            BodyOutcome::Finished(Ok(value)) => {
                self.exit(ExitKind::Completed).await;
                Ok(value)
            }
            BodyOutcome::Finished(Err(error)) => {
                if self.inner.cancel_observed.load(Ordering::Acquire)
                    && self.inner.token.is_cancelled()
                {
                    // The body propagated a cancellation observed at one of
                    // our checkpoints; classify as cancelled, not failed.
                    let cancel = self.cancel_error();
                    self.exit(ExitKind::Cancelled).await;
                    Err(RunError::Cancelled {
                        reason: cancel.reason,
                        message: cancel.message,
                    })
                } else {
                    self.exit(ExitKind::Failed(error.to_string())).await;
                    Err(RunError::Failed(error))
                }
            }
            BodyOutcome::Cancelled => {
                self.inner.cancel_observed.store(true, Ordering::Release);
                let cancel = self.cancel_error();
                self.exit(ExitKind::Cancelled).await;
                Err(RunError::Cancelled {
                    reason: cancel.reason,
                    message: cancel.message,
                })
            }
        }
    }

    /// Cancel this operation (reason [`CancelReason::Manual`]) and its live
    /// children (reason [`CancelReason::Parent`]).
    pub async fn cancel(&self, message: impl Into<String>) -> bool {
        self.cancel_with(CancelReason::Manual, message, true).await
    }

    /// Cancel with an explicit reason, optionally propagating to children.
    pub async fn cancel_with(
        &self,
        reason: CancelReason,
        message: impl Into<String>,
        propagate_to_children: bool,
    ) -> bool {
        self.cancel_boxed(reason, message.into(), propagate_to_children)
            .await
    }

    /// Boxed recursion point: the cancellation walks an arbitrarily deep
    /// child tree.
    fn cancel_boxed(
        &self,
        reason: CancelReason,
        message: String,
        propagate_to_children: bool,
    ) -> futures::future::BoxFuture<'_, bool> {
        Box::pin(async move {
            let fired = self.inner.token.cancel_with(reason, message).await;
            if propagate_to_children {
                for child in self.children() {
                    if child.status().is_active() {
                        child
                            .cancel_boxed(
                                CancelReason::Parent,
                                format!("parent operation {} cancelled", self.inner.id),
                                true,
                            )
                            .await;
                    }
                }
            }
            fired
        })
    }

    /// Report progress to the registered progress callbacks.
    ///
    /// Acts as a cancellation checkpoint: once the token has fired this
    /// returns the cancellation error without invoking any callback.
    pub async fn report_progress(
        &self,
        message: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Result<(), CancelError> {
        if let Err(err) = self.inner.token.check() {
            self.mark_cancel_observed();
            return Err(err);
        }
        let sinks = self.lock_callbacks().progress.clone();
        let event = OperationEvent::Progress {
            operation_id: self.inner.id.clone(),
            message: message.into(),
            metadata: metadata.unwrap_or_default(),
        };
        dispatch(&sinks, &event).await;
        Ok(())
    }

    /// Cooperative cancellation checkpoint for suspension-poor bodies.
    pub async fn checkpoint(&self) -> Result<(), CancelError> {
        self.inner.token.check_async().await.inspect_err(|_| {
            self.mark_cancel_observed();
        })
    }

    /// Hold off cancellation delivery while the returned guard lives.
    ///
    /// Suspension points inside the guarded section do not observe the
    /// enclosing cancellation; delivery resumes when the guard drops. The
    /// token itself stays observable via [`CancelToken::check`] for code
    /// that wants to honor it voluntarily. Shielded sections should be short
    /// and bounded.
    pub fn shield(&self) -> ShieldGuard {
        let depth = self.inner.shield_depth.fetch_add(1, Ordering::AcqRel);
        if depth == 0 {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.status == OperationStatus::Running {
                lifecycle.status = OperationStatus::Shielded;
            }
        }
        ShieldGuard { op: self.clone() }
    }

    /// Wrap a callable so every invocation first checks the token.
    pub fn wrap<F, R>(&self, f: F) -> impl Fn() -> Result<R, CancelError>
    where
        F: Fn() -> R,
    {
        let op = self.clone();
        move || {
            op.inner.token.check().inspect_err(|_| {
                op.mark_cancel_observed();
            })?;
            Ok(f())
        }
    }

    /// A reusable checked-call handle for wrapping many callables at a site.
    pub fn wrapper(&self) -> OperationWrapper {
        OperationWrapper { op: self.clone() }
    }

    pub(crate) fn mark_cancel_observed(&self) {
        self.inner.cancel_observed.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_error(&self) -> CancelError {
        self.inner
            .token
            .check()
            .err()
            .unwrap_or_else(|| CancelError::new(CancelReason::Manual, String::new()))
    }

    /// Resolves once exit has fully completed.
    pub(crate) async fn finished(&self) {
        self.inner.finished.cancelled().await;
    }

    /// Resolves once the token has fired and delivery is permitted: no
    /// shield guard held here, and none held in the live child subtree.
    ///
    /// The wait for our own shield is unbounded (the body keeps running and
    /// drops the guard in finite time if it honors the contract); waits for
    /// child shields are bounded by the shutdown budget per child, so a
    /// child that never releases cannot block delivery forever.
    async fn cancel_delivered(&self) {
        self.inner.token.wait().await;
        self.wait_shield_release().await;
        for child in self.children() {
            if child.status().is_active()
                && tokio::time::timeout(
                    self.inner.shutdown_budget,
                    child.wait_subtree_shield_release(),
                )
                .await
                .is_err()
            {
                tracing::warn!(
                    operation_id = %self.inner.id,
                    child_id = %child.id(),
                    "child shield not released within the shutdown budget"
                );
            }
        }
    }

    async fn wait_shield_release(&self) {
        loop {
            if self.inner.shield_depth.load(Ordering::Acquire) == 0 {
                return;
            }
            let released = self.inner.shield_release.notified();
            tokio::pin!(released);
            // Register before the re-check so a release between check and
            // await cannot be missed.
            released.as_mut().enable();
            if self.inner.shield_depth.load(Ordering::Acquire) == 0 {
                return;
            }
            released.await;
        }
    }

    fn wait_subtree_shield_release(&self) -> futures::future::BoxFuture<'_, ()> {
        Box::pin(async move {
            self.wait_shield_release().await;
            for child in self.children() {
                if child.status().is_active() {
                    child.wait_subtree_shield_release().await;
                }
            }
        })
    }

    async fn enter(&self) -> Result<(), UsageError> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.status != OperationStatus::Pending {
                return Err(UsageError::AlreadyEntered(self.inner.id.clone()));
            }
            lifecycle.status = OperationStatus::Running;
            lifecycle.started_at = Some(Utc::now());
        }
        self.inner.token.bind_runtime();

        if let Some(parent_weak) = &self.inner.parent {
            let parent = parent_weak.upgrade().map(|inner| Operation { inner });
            match parent {
                Some(parent)
                    if matches!(
                        parent.status(),
                        OperationStatus::Running | OperationStatus::Shielded
                    ) =>
                {
                    parent
                        .inner
                        .children
                        .lock()
                        .expect("children lock poisoned")
                        .push(Arc::downgrade(&self.inner));
                }
                _ => {
                    self.rollback_entry(false);
                    return Err(UsageError::ParentNotRunning(
                        self.parent_id().unwrap_or_else(|| "<dropped>".to_string()),
                    ));
                }
            }
        }

        if self.inner.register_globally
            && let Err(err) = self.inner.registry.register(self)
        {
            self.rollback_entry(true);
            return Err(err);
        }

        let scope = SourceScope::new(
            self.inner.id.clone(),
            self.inner.token.clone(),
            Arc::clone(&self.inner.callbacks),
        );
        let ordered = self.ordered_sources();
        for (index, source) in ordered.iter().enumerate() {
            if let Err(err) = source.activate(&scope).await {
                for activated in ordered[..index].iter().rev() {
                    activated.deactivate().await;
                }
                if self.inner.register_globally {
                    self.inner.registry.unregister(self);
                }
                self.rollback_entry(true);
                return Err(err);
            }
        }

        let sinks = self.lock_callbacks().start.clone();
        let event = OperationEvent::Started {
            operation_id: self.inner.id.clone(),
            name: self.inner.name.clone(),
        };
        dispatch(&sinks, &event).await;
        tracing::debug!(
            operation_id = %self.inner.id,
            name = self.inner.name.as_deref().unwrap_or(""),
            "operation entered"
        );
        Ok(())
    }

    /// Undo a partial entry so the operation reads as never entered.
    fn rollback_entry(&self, unlink_parent: bool) {
        {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.status = OperationStatus::Pending;
            lifecycle.started_at = None;
        }
        if unlink_parent {
            self.unlink_from_parent();
        }
    }

    async fn exit(&self, kind: ExitKind) {
        for source in self.ordered_sources().iter().rev() {
            source.deactivate().await;
        }

        self.settle_children().await;

        let duration_ms = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.ended_at = Some(Utc::now());
            lifecycle.status = match kind {
                ExitKind::Completed => OperationStatus::Completed,
                ExitKind::Cancelled => OperationStatus::Cancelled,
                ExitKind::Failed(_) => OperationStatus::Failed,
            };
            match (lifecycle.started_at, lifecycle.ended_at) {
                (Some(start), Some(end)) => {
                    (end - start).to_std().unwrap_or_default().as_millis() as u64
                }
                _ => 0,
            }
        };

        let (sinks, event) = match &kind {
            ExitKind::Completed => (
                self.lock_callbacks().complete.clone(),
                OperationEvent::Completed {
                    operation_id: self.inner.id.clone(),
                    duration_ms,
                },
            ),
            ExitKind::Cancelled => {
                let cancel = self.cancel_error();
                (
                    self.lock_callbacks().cancel.clone(),
                    OperationEvent::Cancelled {
                        operation_id: self.inner.id.clone(),
                        reason: cancel.reason,
                        message: cancel.message,
                        duration_ms,
                    },
                )
            }
            ExitKind::Failed(error) => (
                self.lock_callbacks().error.clone(),
                OperationEvent::Failed {
                    operation_id: self.inner.id.clone(),
                    error: error.clone(),
                    duration_ms,
                },
            ),
        };
        dispatch(&sinks, &event).await;

        if self.inner.register_globally {
            self.inner.registry.unregister(self);
        }
        self.unlink_from_parent();
        self.inner.finished.cancel();
        tracing::debug!(
            operation_id = %self.inner.id,
            status = %self.status(),
            "operation exited"
        );
    }

    /// Cancel any still-live children and wait for each within the shutdown
    /// budget. Runs before the final status is recorded, so a parent is
    /// never externally `Cancelled` while a child is still unsettled.
    async fn settle_children(&self) {
        let children = self.children();
        for child in &children {
            if child.status().is_active() {
                child
                    .cancel_with(
                        CancelReason::Parent,
                        format!("parent operation {} cancelled", self.inner.id),
                        true,
                    )
                    .await;
            }
        }
        for child in &children {
            if child.status().is_terminal() {
                continue;
            }
            if tokio::time::timeout(self.inner.shutdown_budget, child.finished())
                .await
                .is_err()
            {
                tracing::warn!(
                    operation_id = %self.inner.id,
                    child_id = %child.id(),
                    "child did not finish within the shutdown budget"
                );
            }
        }
    }

    fn unlink_from_parent(&self) {
        let Some(parent) = self.inner.parent.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        parent
            .children
            .lock()
            .expect("children lock poisoned")
            .retain(|weak| {
                weak.upgrade()
                    .is_some_and(|child| !Arc::ptr_eq(&child, &self.inner))
            });
    }

    /// Exit path for a run future that was dropped mid-flight by an
    /// enclosing scope. The operation's own token may not have fired; treat
    /// the drop as runtime-native cancellation from the outside.
    async fn exit_abandoned(self) {
        if !self.inner.token.is_cancelled() {
            self.inner
                .token
                .cancel_with(CancelReason::Parent, "enclosing scope dropped")
                .await;
        }
        self.exit(ExitKind::Cancelled).await;
    }

    /// Best-effort cleanup when the run future is dropped outside any
    /// runtime: monitors died with the runtime, so only bookkeeping remains.
    fn exit_abandoned_sync(self) {
        self.inner
            .token
            .cancel_sync_with(CancelReason::Parent, "enclosing scope dropped");
        {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.ended_at = Some(Utc::now());
            lifecycle.status = OperationStatus::Cancelled;
        }
        if self.inner.register_globally {
            self.inner.registry.unregister(&self);
        }
        self.unlink_from_parent();
        self.inner.finished.cancel();
    }

    fn ordered_sources(&self) -> Vec<Arc<dyn CancelSource>> {
        let mut ordered: Vec<Arc<dyn CancelSource>> = Vec::with_capacity(self.inner.sources.len());
        ordered.extend(
            self.inner
                .sources
                .iter()
                .filter(|source| source.is_deadline())
                .cloned(),
        );
        ordered.extend(
            self.inner
                .sources
                .iter()
                .filter(|source| !source.is_deadline())
                .cloned(),
        );
        ordered
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().expect("lifecycle lock poisoned")
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, CallbackSet> {
        self.inner.callbacks.lock().expect("callback lock poisoned")
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

/// RAII guard holding off cancellation delivery; see [`Operation::shield`].
#[must_use = "dropping the guard immediately ends the shielded section"]
pub struct ShieldGuard {
    op: Operation,
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        let prev = self.op.inner.shield_depth.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let mut lifecycle = self.op.lock_lifecycle();
            if lifecycle.status == OperationStatus::Shielded {
                lifecycle.status = OperationStatus::Running;
            }
            drop(lifecycle);
            self.op.inner.shield_release.notify_waiters();
        }
    }
}

/// Checked-call handle returned by [`Operation::wrapper`].
#[derive(Clone)]
pub struct OperationWrapper {
    op: Operation,
}

impl OperationWrapper {
    /// Check the token, then invoke `f`.
    pub fn call<R>(&self, f: impl FnOnce() -> R) -> Result<R, CancelError> {
        self.op.inner.token.check().inspect_err(|_| {
            self.op.mark_cancel_observed();
        })?;
        Ok(f())
    }
}

/// Ensures exit bookkeeping runs even when the run future is dropped by an
/// enclosing scope instead of completing.
struct AbandonGuard {
    op: Option<Operation>,
}

impl AbandonGuard {
    fn disarm(&mut self) {
        self.op = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(op) = self.op.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(op.exit_abandoned());
            }
            Err(_) => op.exit_abandoned_sync(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;

    fn test_registry() -> OperationRegistry {
        OperationRegistry::new(RegistryConfig::default())
    }

    #[tokio::test]
    async fn completed_run_returns_value_and_status() {
        let registry = test_registry();
        let op = Operation::builder()
            .name("noop")
            .registry(&registry)
            .build();
        let result: Result<u32, RunError<CancelError>> = op.run(async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(op.status(), OperationStatus::Completed);
        assert!(op.duration().is_some());
    }

    #[tokio::test]
    async fn double_entry_fails_fast() {
        let registry = test_registry();
        let op = Operation::builder().registry(&registry).build();
        let _: Result<(), RunError<CancelError>> = op.run(async { Ok(()) }).await;
        let second: Result<(), RunError<CancelError>> = op.run(async { Ok(()) }).await;
        assert!(matches!(
            second,
            Err(RunError::Usage(UsageError::AlreadyEntered(_)))
        ));
    }

    #[tokio::test]
    async fn body_error_marks_failed() {
        let registry = test_registry();
        let op = Operation::builder().registry(&registry).build();
        let result: Result<(), RunError<std::io::Error>> = op
            .run(async { Err(std::io::Error::other("boom")) })
            .await;
        assert!(matches!(result, Err(RunError::Failed(_))));
        assert_eq!(op.status(), OperationStatus::Failed);
    }

    #[tokio::test]
    async fn checkpoint_propagation_is_classified_as_cancelled() {
        let registry = test_registry();
        let op = Operation::builder().registry(&registry).build();

        let body_op = op.clone();
        let result: Result<(), RunError<CancelError>> = op
            .run(async move {
                // A body that fires the token and observes the cancellation
                // synchronously, propagating the error itself without ever
                // suspending.
                body_op.token().cancel_sync("stop now");
                body_op.wrapper().call(|| ())?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RunError::Cancelled { .. })));
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert_eq!(op.reason(), Some(CancelReason::Manual));
    }

    #[tokio::test]
    async fn child_under_unentered_parent_is_rejected() {
        let registry = test_registry();
        let parent = Operation::builder().registry(&registry).build();
        let child = Operation::builder()
            .registry(&registry)
            .parent(&parent)
            .build();
        let result: Result<(), RunError<CancelError>> = child.run(async { Ok(()) }).await;
        assert!(matches!(
            result,
            Err(RunError::Usage(UsageError::ParentNotRunning(_)))
        ));
        assert_eq!(child.status(), OperationStatus::Pending);
    }

    #[tokio::test]
    async fn wrap_checks_before_each_call() {
        let registry = test_registry();
        let op = Operation::builder().registry(&registry).build();
        let wrapped = op.wrap(|| "ran");
        assert_eq!(wrapped().unwrap(), "ran");
        op.token().cancel_sync("halt");
        assert!(wrapped().is_err());
    }
}
