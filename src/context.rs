//! Ambient access to the innermost active operation.
//!
//! The current operation rides on the task-local storage of the runtime, so
//! concurrent tasks never observe each other's scope and the reference
//! unwinds structurally with the task, even on abnormal exit. Library code
//! deep in a call tree can ask "am I inside a cancellable operation?"
//! without the operation being threaded through every signature.

use crate::operation::Operation;

tokio::task_local! {
    pub(crate) static CURRENT_OPERATION: Operation;
}

/// The innermost active operation for the current task, if any.
///
/// Returns `None` outside any operation scope, including on tasks spawned
/// from within a scope (spawned tasks do not inherit the ambient context;
/// pass the operation handle explicitly when a spawned task needs it).
pub fn current_operation() -> Option<Operation> {
    CURRENT_OPERATION.try_with(|op| op.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outside_any_scope_returns_none() {
        assert!(current_operation().is_none());
    }
}
