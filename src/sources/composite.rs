//! Source combinators: any-of (OR) and all-of (AND) firing semantics.

use super::{CancelSource, SourceCore, SourceScope};
use crate::error::UsageError;
use crate::token::{CancelReason, CancelToken};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Fires when the first of its children fires.
///
/// Children cancel the operation's token directly, and the token is one-shot,
/// so the first child to fire wins and its reason and message become the
/// operation's. Construction consumes the children; the composite (and each
/// child through it) can only ever be activated once.
pub struct AnyOfSource {
    core: SourceCore,
    children: Vec<Arc<dyn CancelSource>>,
}

impl AnyOfSource {
    pub fn new(children: Vec<Box<dyn CancelSource>>) -> Self {
        let children: Vec<Arc<dyn CancelSource>> =
            children.into_iter().map(Arc::from).collect();
        Self {
            core: SourceCore::new(format!("any of {} sources", children.len())),
            children,
        }
    }

    /// The first child that fired, with its list position.
    pub fn fired_child(&self) -> Option<(usize, String)> {
        self.children
            .iter()
            .enumerate()
            .find(|(_, child)| child.triggered())
            .map(|(index, child)| (index, child.description()))
    }
}

#[async_trait]
impl CancelSource for AnyOfSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.children.iter().any(|child| child.triggered())
    }

    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;
        if self.children.is_empty() {
            return Err(UsageError::InvalidSource(
                "any-of composite needs at least one child source".to_string(),
            ));
        }
        for child in &self.children {
            child.activate(scope).await?;
        }
        Ok(())
    }

    async fn deactivate(&self) {
        for child in self.children.iter().rev() {
            child.deactivate().await;
        }
    }
}

struct AllOfState {
    /// Contributing reasons in arrival order.
    arrivals: Vec<String>,
    fired: bool,
}

/// Fires only once every child has fired.
///
/// Children fire into private intermediate tokens rather than the operation's
/// token, so an individual trigger only counts; the composite cancels with
/// [`CancelReason::Condition`] and a message naming every contributing reason
/// once the count reaches the child total.
pub struct AllOfSource {
    core: SourceCore,
    children: Vec<Arc<dyn CancelSource>>,
    intermediates: Vec<CancelToken>,
    state: Arc<Mutex<AllOfState>>,
}

impl AllOfSource {
    pub fn new(children: Vec<Box<dyn CancelSource>>) -> Self {
        let children: Vec<Arc<dyn CancelSource>> =
            children.into_iter().map(Arc::from).collect();
        let intermediates = children.iter().map(|_| CancelToken::new()).collect();
        Self {
            core: SourceCore::new(format!("all of {} sources", children.len())),
            children,
            intermediates,
            state: Arc::new(Mutex::new(AllOfState {
                arrivals: Vec::new(),
                fired: false,
            })),
        }
    }

    /// Reasons recorded so far, in arrival order.
    pub fn arrivals(&self) -> Vec<String> {
        self.state.lock().expect("all-of state lock poisoned").arrivals.clone()
    }
}

#[async_trait]
impl CancelSource for AllOfSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.core.triggered()
    }

    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;
        let total = self.children.len();
        if total == 0 {
            return Err(UsageError::InvalidSource(
                "all-of composite needs at least one child source".to_string(),
            ));
        }

        // Wire intermediates before activating children, so a child that
        // fires during activation (a past deadline, a pre-cancelled token)
        // is still counted.
        for intermediate in &self.intermediates {
            let state = Arc::clone(&self.state);
            let triggered = self.core.triggered_flag();
            let operation_token = scope.token().clone();
            intermediate.register_callback(move |err| {
                let message = {
                    let mut state = state.lock().expect("all-of state lock poisoned");
                    state.arrivals.push(format!("{}: {}", err.reason, err.message));
                    if state.arrivals.len() == total && !state.fired {
                        state.fired = true;
                        Some(state.arrivals.join("; "))
                    } else {
                        None
                    }
                };
                if let Some(message) = message {
                    triggered.store(true, Ordering::Release);
                    operation_token.cancel_sync_with(
                        CancelReason::Condition,
                        format!("all conditions met: {message}"),
                    );
                }
            });
        }

        for (child, intermediate) in self.children.iter().zip(&self.intermediates) {
            let child_scope = scope.with_token(intermediate.clone());
            child.activate(&child_scope).await?;
        }
        Ok(())
    }

    async fn deactivate(&self) {
        for child in self.children.iter().rev() {
            child.deactivate().await;
        }
    }
}
