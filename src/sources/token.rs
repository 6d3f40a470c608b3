//! Cancellation driven by an externally owned token.

use super::{CancelSource, SourceCore, SourceScope};
use crate::error::UsageError;
use crate::token::{CancelReason, CancelToken};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Propagates an external [`CancelToken`] into the operation.
///
/// When the external token fires, the operation's token is cancelled with
/// [`CancelReason::Manual`] and the external token's message. No monitor task
/// is needed; the external token's own callback machinery does the work.
pub struct TokenSource {
    core: SourceCore,
    external: CancelToken,
    /// Cleared on deactivation so a later external fire no longer propagates.
    armed: Arc<AtomicBool>,
}

impl TokenSource {
    pub fn new(external: CancelToken) -> Self {
        Self {
            core: SourceCore::new(format!("external token {}", external.origin())),
            external,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CancelSource for TokenSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.core.triggered()
    }

    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;
        self.armed.store(true, Ordering::Release);

        let armed = Arc::clone(&self.armed);
        let triggered = self.core.triggered_flag();
        let operation_token = scope.token().clone();
        self.external.register_callback(move |err| {
            if !armed.load(Ordering::Acquire) {
                return;
            }
            triggered.store(true, Ordering::Release);
            operation_token.cancel_sync_with(
                CancelReason::Manual,
                format!("external token cancelled: {}", err.message),
            );
        });
        Ok(())
    }

    async fn deactivate(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallbackSet;
    use std::sync::Mutex;
    use std::time::Duration;

    fn scope(token: &CancelToken) -> SourceScope {
        SourceScope::new(
            "op-test".to_string(),
            token.clone(),
            Arc::new(Mutex::new(CallbackSet::default())),
        )
    }

    #[tokio::test]
    async fn external_fire_propagates_as_manual() {
        let external = CancelToken::new();
        let operation_token = CancelToken::new();
        let source = TokenSource::new(external.clone());
        source.activate(&scope(&operation_token)).await.unwrap();

        external.cancel("stop requested").await;
        tokio::time::timeout(Duration::from_secs(1), operation_token.wait())
            .await
            .expect("external fire should propagate");
        assert_eq!(operation_token.reason(), Some(CancelReason::Manual));
        assert!(
            operation_token
                .message()
                .unwrap()
                .contains("stop requested")
        );
        assert!(source.triggered());
    }

    #[tokio::test]
    async fn already_cancelled_external_fires_at_activation() {
        let external = CancelToken::new();
        external.cancel("pre-cancelled").await;

        let operation_token = CancelToken::new();
        let source = TokenSource::new(external);
        source.activate(&scope(&operation_token)).await.unwrap();
        assert!(operation_token.is_cancelled());
    }

    #[tokio::test]
    async fn deactivated_source_no_longer_propagates() {
        let external = CancelToken::new();
        let operation_token = CancelToken::new();
        let source = TokenSource::new(external.clone());
        source.activate(&scope(&operation_token)).await.unwrap();
        source.deactivate().await;

        external.cancel("late").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!operation_token.is_cancelled());
        assert!(!source.triggered());
    }
}
