//! Deadline-based cancellation.

use super::{CancelSource, MonitorTask, SourceCore, SourceScope};
use crate::error::UsageError;
use crate::token::CancelReason;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

enum DeadlineKind {
    /// Relative to activation time.
    After(Duration),
    /// Absolute monotonic instant.
    At(Instant),
}

/// Cancels the operation with [`CancelReason::Timeout`] once a monotonic
/// deadline passes.
///
/// A deadline that is already in the past when the source activates fires
/// immediately; the operation observes the cancellation at its next
/// suspension point.
pub struct DeadlineSource {
    core: SourceCore,
    kind: DeadlineKind,
    /// Resolved at activation; readable afterwards via [`DeadlineSource::deadline`].
    resolved: Mutex<Option<Instant>>,
}

impl DeadlineSource {
    /// Fire after `duration`, measured from activation on the monotonic clock.
    pub fn after(duration: Duration) -> Self {
        Self {
            core: SourceCore::new(format!("deadline after {duration:?}")),
            kind: DeadlineKind::After(duration),
            resolved: Mutex::new(None),
        }
    }

    /// Fire at an absolute monotonic instant.
    pub fn at(deadline: Instant) -> Self {
        Self {
            core: SourceCore::new("deadline at instant".to_string()),
            kind: DeadlineKind::At(deadline),
            resolved: Mutex::new(None),
        }
    }

    /// Fire at a wall-clock time, converted to the monotonic clock now.
    ///
    /// A wall-clock deadline that already lies in the past is rejected here
    /// rather than producing a surprising instant cancel later.
    pub fn until(when: DateTime<Utc>) -> Result<Self, UsageError> {
        let remaining = (when - Utc::now()).to_std().map_err(|_| {
            UsageError::InvalidSource(format!("wall-clock deadline {when} is in the past"))
        })?;
        Ok(Self {
            core: SourceCore::new(format!("deadline until {when}")),
            kind: DeadlineKind::After(remaining),
            resolved: Mutex::new(None),
        })
    }

    /// The monotonic deadline this source armed, once activated.
    pub fn deadline(&self) -> Option<Instant> {
        *self.resolved.lock().expect("deadline lock poisoned")
    }
}

#[async_trait]
impl CancelSource for DeadlineSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.core.triggered()
    }

    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;

        let deadline = match self.kind {
            DeadlineKind::After(duration) => Instant::now() + duration,
            DeadlineKind::At(instant) => instant,
        };
        *self.resolved.lock().expect("deadline lock poisoned") = Some(deadline);

        let token = scope.token().clone();
        let triggered = self.core.triggered_flag();
        let description = self.core.description().to_string();
        let operation_id = scope.operation_id().to_string();

        self.core.push_monitor(MonitorTask::spawn(move |stop| async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    triggered.store(true, Ordering::Release);
                    tracing::debug!(operation_id = %operation_id, "{description} fired");
                    token
                        .cancel_with(CancelReason::Timeout, format!("{description} exceeded"))
                        .await;
                }
            }
        }));
        Ok(())
    }

    async fn deactivate(&self) {
        self.core.stop_monitors().await;
    }

    fn is_deadline(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallbackSet;
    use crate::token::CancelToken;
    use std::sync::Arc;

    fn scope(token: &CancelToken) -> SourceScope {
        SourceScope::new(
            "op-test".to_string(),
            token.clone(),
            Arc::new(Mutex::new(CallbackSet::default())),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let token = CancelToken::new();
        let source = DeadlineSource::after(Duration::from_millis(100));
        source.activate(&scope(&token)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(source.triggered());
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
        source.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_fires_immediately() {
        let token = CancelToken::new();
        let source = DeadlineSource::after(Duration::ZERO);
        source.activate(&scope(&token)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(token.is_cancelled());
        source.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_before_deadline_does_not_fire() {
        let token = CancelToken::new();
        let source = DeadlineSource::after(Duration::from_secs(60));
        source.activate(&scope(&token)).await.unwrap();
        source.deactivate().await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!source.triggered());
        assert!(!token.is_cancelled());
        // Deactivation is idempotent.
        source.deactivate().await;
    }

    #[tokio::test]
    async fn second_activation_fails_fast() {
        let token = CancelToken::new();
        let source = DeadlineSource::after(Duration::from_secs(60));
        source.activate(&scope(&token)).await.unwrap();
        let err = source.activate(&scope(&token)).await.unwrap_err();
        assert!(matches!(err, UsageError::SourceAlreadyActive(_)));
        source.deactivate().await;
    }

    #[test]
    fn wall_clock_deadline_in_past_is_rejected() {
        let past = Utc::now() - chrono::Duration::seconds(10);
        assert!(matches!(
            DeadlineSource::until(past),
            Err(UsageError::InvalidSource(_))
        ));
    }
}
