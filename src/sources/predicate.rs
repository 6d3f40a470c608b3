//! Predicate-polling cancellation.

use super::{CancelSource, MonitorTask, SourceCore, SourceScope};
use crate::error::UsageError;
use crate::token::CancelReason;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

enum Predicate {
    /// Evaluated on the blocking pool so a slow predicate cannot stall the
    /// executor.
    Sync(Arc<dyn Fn() -> bool + Send + Sync>),
    Async(Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>),
}

/// Polls a predicate at a fixed interval and cancels the operation with
/// [`CancelReason::Condition`] when it holds.
///
/// With a `sustained` window, the predicate must stay true continuously for
/// the whole window; the first false observation resets it.
pub struct PredicateSource {
    core: SourceCore,
    predicate: Predicate,
    interval: Duration,
    sustained: Duration,
}

impl PredicateSource {
    /// Poll a synchronous predicate every `interval`.
    pub fn new(
        predicate: impl Fn() -> bool + Send + Sync + 'static,
        interval: Duration,
    ) -> Result<Self, UsageError> {
        Self::build(Predicate::Sync(Arc::new(predicate)), interval)
    }

    /// Poll an async predicate every `interval`.
    pub fn new_async<F, Fut>(predicate: F, interval: Duration) -> Result<Self, UsageError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self::build(
            Predicate::Async(Arc::new(move || Box::pin(predicate()))),
            interval,
        )
    }

    fn build(predicate: Predicate, interval: Duration) -> Result<Self, UsageError> {
        if interval.is_zero() {
            return Err(UsageError::InvalidSource(
                "predicate poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            core: SourceCore::new(format!("predicate polled every {interval:?}")),
            predicate,
            interval,
            sustained: Duration::ZERO,
        })
    }

    /// Require the predicate to hold continuously for `window` before firing.
    pub fn sustained(mut self, window: Duration) -> Self {
        self.sustained = window;
        self
    }
}

#[async_trait]
impl CancelSource for PredicateSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.core.triggered()
    }

    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;

        let token = scope.token().clone();
        let triggered = self.core.triggered_flag();
        let description = self.core.description().to_string();
        let interval = self.interval;
        let sustained = self.sustained;
        let predicate = match &self.predicate {
            Predicate::Sync(f) => Predicate::Sync(Arc::clone(f)),
            Predicate::Async(f) => Predicate::Async(Arc::clone(f)),
        };
        let scope = scope.clone();

        self.core.push_monitor(MonitorTask::spawn(move |stop| async move {
            let mut held_since: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let value = match &predicate {
                    Predicate::Sync(f) => {
                        let f = Arc::clone(f);
                        match tokio::task::spawn_blocking(move || f()).await {
                            Ok(value) => value,
                            Err(err) => {
                                scope
                                    .report_failure(&description, &err.to_string())
                                    .await;
                                return;
                            }
                        }
                    }
                    Predicate::Async(f) => f().await,
                };

                if !value {
                    held_since = None;
                    continue;
                }

                let fire = if sustained.is_zero() {
                    true
                } else {
                    let since = *held_since.get_or_insert_with(Instant::now);
                    since.elapsed() >= sustained
                };

                if fire {
                    triggered.store(true, Ordering::Release);
                    token
                        .cancel_with(CancelReason::Condition, format!("{description} held"))
                        .await;
                    return;
                }
            }
        }));
        Ok(())
    }

    async fn deactivate(&self) {
        self.core.stop_monitors().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallbackSet;
    use crate::token::CancelToken;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn scope(token: &CancelToken) -> SourceScope {
        SourceScope::new(
            "op-test".to_string(),
            token.clone(),
            Arc::new(Mutex::new(CallbackSet::default())),
        )
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            PredicateSource::new(|| true, Duration::ZERO),
            Err(UsageError::InvalidSource(_))
        ));
    }

    #[tokio::test]
    async fn fires_when_predicate_holds() {
        let token = CancelToken::new();
        let flag = Arc::new(AtomicBool::new(false));
        let probe = flag.clone();
        let source = PredicateSource::new(
            move || probe.load(Ordering::SeqCst),
            Duration::from_millis(10),
        )
        .unwrap();
        source.activate(&scope(&token)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!token.is_cancelled());

        flag.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), token.wait())
            .await
            .expect("predicate should fire");
        assert_eq!(token.reason(), Some(CancelReason::Condition));
        assert!(source.triggered());
        source.deactivate().await;
    }

    #[tokio::test]
    async fn sustained_window_resets_on_false() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        // True on every poll except the third, which resets the window.
        let source = PredicateSource::new(
            move || counter.fetch_add(1, Ordering::SeqCst) != 2,
            Duration::from_millis(10),
        )
        .unwrap()
        .sustained(Duration::from_millis(200));
        source.activate(&scope(&token)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !token.is_cancelled(),
            "window should have been reset by the false return"
        );

        tokio::time::timeout(Duration::from_secs(2), token.wait())
            .await
            .expect("predicate should eventually hold for the full window");
        source.deactivate().await;
    }

    #[tokio::test]
    async fn async_predicate_fires() {
        let token = CancelToken::new();
        let source =
            PredicateSource::new_async(|| async { true }, Duration::from_millis(10)).unwrap();
        source.activate(&scope(&token)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.wait())
            .await
            .expect("async predicate should fire");
        source.deactivate().await;
    }

    #[tokio::test]
    async fn deactivation_stops_polling() {
        let token = CancelToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = PredicateSource::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            },
            Duration::from_millis(5),
        )
        .unwrap();
        source.activate(&scope(&token)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        source.deactivate().await;

        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);
        assert!(!token.is_cancelled());
    }
}
