//! Process-wide directory of live and recently finished operations.
//!
//! Active operations register on entry and move to a bounded history ring on
//! exit. All mutation happens under one lock with bounded critical sections;
//! everything handed back to callers is an independent snapshot. The global
//! registry is created lazily on first use; tests that need isolation build
//! their own [`OperationRegistry`] and point operations at it.

use crate::bridge::RuntimeBridge;
use crate::error::UsageError;
use crate::operation::{Operation, OperationSnapshot, OperationStatus};
use crate::token::CancelReason;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Retention settings for finished operations.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum finished operations kept in history; oldest drop first.
    pub max_history: usize,
    /// Age beyond which the periodic cleanup task drops history entries.
    pub history_max_age: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_history: 1000,
            history_max_age: None,
        }
    }
}

/// Filter for [`OperationRegistry::list`] and bulk cancellation. Empty
/// filters match everything.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub parent_id: Option<String>,
    /// Shell-style glob matched against the operation name. Unnamed
    /// operations never match a pattern.
    pub name_pattern: Option<String>,
    pub min_age: Option<Duration>,
    pub max_age: Option<Duration>,
}

impl OperationFilter {
    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn min_age(mut self, age: Duration) -> Self {
        self.min_age = Some(age);
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    fn matches(&self, snapshot: &OperationSnapshot) -> bool {
        if self.status.is_some_and(|status| status != snapshot.status) {
            return false;
        }
        if self
            .parent_id
            .as_ref()
            .is_some_and(|parent| snapshot.parent_id.as_deref() != Some(parent.as_str()))
        {
            return false;
        }
        if let Some(pattern) = &self.name_pattern
            && !matches_name(pattern, snapshot.name.as_deref())
        {
            return false;
        }
        if self.min_age.is_some() || self.max_age.is_some() {
            let age = (Utc::now() - snapshot.created_at)
                .to_std()
                .unwrap_or_default();
            if self.min_age.is_some_and(|min| age < min) {
                return false;
            }
            if self.max_age.is_some_and(|max| age > max) {
                return false;
            }
        }
        true
    }
}

fn matches_name(pattern: &str, name: Option<&str>) -> bool {
    let Some(name) = name else {
        return false;
    };
    match globset::Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(err) => {
            tracing::warn!("invalid operation name pattern '{pattern}': {err}");
            false
        }
    }
}

struct RegistryState {
    active: HashMap<String, Operation>,
    history: VecDeque<OperationSnapshot>,
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
    cleanup_stop: tokio_util::sync::CancellationToken,
}

impl Drop for RegistryShared {
    fn drop(&mut self) {
        self.cleanup_stop.cancel();
    }
}

/// Tracks active operations and retains a bounded history of finished ones.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OperationRegistry {
    shared: Arc<RegistryShared>,
}

impl OperationRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                state: Mutex::new(RegistryState {
                    active: HashMap::new(),
                    history: VecDeque::new(),
                }),
                config,
                cleanup_stop: tokio_util::sync::CancellationToken::new(),
            }),
        }
    }

    /// Insert an entering operation. A duplicate id is a caller bug.
    pub(crate) fn register(&self, op: &Operation) -> Result<(), UsageError> {
        let mut state = self.lock_state();
        if state.active.contains_key(op.id()) {
            return Err(UsageError::DuplicateId(op.id().to_string()));
        }
        state.active.insert(op.id().to_string(), op.clone());
        tracing::debug!(operation_id = %op.id(), "operation registered");
        Ok(())
    }

    /// Move an exiting operation to history. Unknown ids are a no-op.
    pub(crate) fn unregister(&self, op: &Operation) {
        let mut state = self.lock_state();
        if state.active.remove(op.id()).is_none() {
            return;
        }
        state.history.push_back(op.snapshot());
        let cap = self.shared.config.max_history;
        while state.history.len() > cap {
            state.history.pop_front();
        }
        tracing::debug!(operation_id = %op.id(), "operation moved to history");
    }

    /// Snapshot of an active or historical operation.
    pub fn get(&self, id: &str) -> Option<OperationSnapshot> {
        let state = self.lock_state();
        if let Some(op) = state.active.get(id) {
            return Some(op.snapshot());
        }
        state
            .history
            .iter()
            .rev()
            .find(|snapshot| snapshot.id == id)
            .cloned()
    }

    /// Live handle to an active operation.
    pub fn get_active(&self, id: &str) -> Option<Operation> {
        self.lock_state().active.get(id).cloned()
    }

    /// Snapshots of active operations matching `filter`.
    pub fn list(&self, filter: &OperationFilter) -> Vec<OperationSnapshot> {
        self.lock_state()
            .active
            .values()
            .map(Operation::snapshot)
            .filter(|snapshot| filter.matches(snapshot))
            .collect()
    }

    /// Snapshots of finished operations, oldest first.
    pub fn history(&self) -> Vec<OperationSnapshot> {
        self.lock_state().history.iter().cloned().collect()
    }

    /// Direct children of `parent_id` that are currently active.
    pub fn get_children(&self, parent_id: &str) -> Vec<OperationSnapshot> {
        self.lock_state()
            .active
            .values()
            .map(Operation::snapshot)
            .filter(|snapshot| snapshot.parent_id.as_deref() == Some(parent_id))
            .collect()
    }

    /// Cancel one operation by id. Returns true when the operation was found
    /// and its token transitioned.
    pub async fn cancel_operation(
        &self,
        id: &str,
        reason: CancelReason,
        message: impl Into<String>,
    ) -> bool {
        let Some(op) = self.get_active(id) else {
            tracing::warn!(operation_id = %id, "cancel requested for unknown operation");
            return false;
        };
        op.cancel_with(reason, message, true).await
    }

    /// Cancel every active operation matching `filter`. Returns how many
    /// tokens transitioned.
    pub async fn cancel_all(
        &self,
        filter: &OperationFilter,
        reason: CancelReason,
        message: impl Into<String>,
    ) -> usize {
        let message = message.into();
        let targets: Vec<Operation> = {
            let state = self.lock_state();
            state
                .active
                .values()
                .filter(|op| filter.matches(&op.snapshot()))
                .cloned()
                .collect()
        };
        let mut cancelled = 0;
        for op in targets {
            if op.cancel_with(reason, message.clone(), true).await {
                cancelled += 1;
            }
        }
        tracing::debug!("bulk cancel matched and cancelled {cancelled} operation(s)");
        cancelled
    }

    /// Trim history: entries older than `max_age`, or everything when `None`.
    pub fn cleanup_completed(&self, max_age: Option<Duration>) {
        let mut state = self.lock_state();
        match max_age {
            None => state.history.clear(),
            Some(max_age) => {
                let now = Utc::now();
                state.history.retain(|snapshot| {
                    let reference = snapshot.ended_at.unwrap_or(snapshot.created_at);
                    (now - reference).to_std().unwrap_or_default() <= max_age
                });
            }
        }
    }

    /// Drop all state without cancelling anything. Test isolation only.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.active.clear();
        state.history.clear();
    }

    pub fn active_count(&self) -> usize {
        self.lock_state().active.len()
    }

    /// Periodically trim history by the configured age and count caps. The
    /// task holds only a weak reference and stops when the registry is
    /// dropped; outside a runtime it is skipped.
    pub fn spawn_cleanup_task(&self, interval: Duration) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("no runtime available, history cleanup task not started");
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let stop = self.shared.cleanup_stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        let registry = OperationRegistry { shared };
                        if let Some(max_age) = registry.shared.config.history_max_age {
                            registry.cleanup_completed(Some(max_age));
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            tracing::debug!("history cleanup task stopped");
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.shared.state.lock().expect("registry lock poisoned")
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

static GLOBAL_REGISTRY: OnceLock<OperationRegistry> = OnceLock::new();

/// The process-wide registry, created lazily on first use.
pub fn global_registry() -> OperationRegistry {
    GLOBAL_REGISTRY
        .get_or_init(OperationRegistry::default)
        .clone()
}

/// Synchronous facade over a registry for threads outside the runtime.
///
/// Lookup methods read the shared state directly; cancellation methods run
/// the async cancel on the bridged runtime. Must not be used from inside the
/// runtime itself (the runtime rejects nested blocking).
pub struct SyncRegistryHandle {
    registry: OperationRegistry,
    bridge: RuntimeBridge,
}

impl SyncRegistryHandle {
    pub fn new(registry: OperationRegistry, bridge: RuntimeBridge) -> Self {
        Self { registry, bridge }
    }

    pub fn get(&self, id: &str) -> Option<OperationSnapshot> {
        self.registry.get(id)
    }

    pub fn list(&self, filter: &OperationFilter) -> Vec<OperationSnapshot> {
        self.registry.list(filter)
    }

    pub fn cancel_operation(
        &self,
        id: &str,
        reason: CancelReason,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        self.bridge
            .block_on(self.registry.cancel_operation(id, reason, message))
    }

    pub fn cancel_all(
        &self,
        filter: &OperationFilter,
        reason: CancelReason,
        message: impl Into<String>,
    ) -> usize {
        let message = message.into();
        self.bridge
            .block_on(self.registry.cancel_all(filter, reason, message))
    }
}
