//! OS-signal-based cancellation.
//!
//! On unix, any set of signals can be watched via the runtime's signal
//! streams; dropping a stream on deactivation releases the registration (the
//! runtime multiplexes handlers internally, so there is no per-source handler
//! to restore). On other platforms only the interrupt signal (Ctrl-C) is
//! available.

use super::{CancelSource, MonitorTask, SourceCore, SourceScope};
use crate::error::UsageError;
use crate::token::CancelReason;
use async_trait::async_trait;
use std::sync::atomic::Ordering;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Cancels the operation with [`CancelReason::Signal`] when one of the
/// watched OS signals arrives.
///
/// Signals are delivered on arbitrary threads; the token's thread-safe
/// signalling path makes the hop back to the operation safe.
pub struct SignalSource {
    core: SourceCore,
    #[cfg(unix)]
    kinds: Vec<SignalKind>,
}

#[cfg(unix)]
impl SignalSource {
    /// Watch the given signals.
    pub fn new(kinds: impl IntoIterator<Item = SignalKind>) -> Self {
        let kinds: Vec<SignalKind> = kinds.into_iter().collect();
        let numbers: Vec<String> = kinds
            .iter()
            .map(|kind| kind.as_raw_value().to_string())
            .collect();
        Self {
            core: SourceCore::new(format!("signal [{}]", numbers.join(", "))),
            kinds,
        }
    }

    /// Watch SIGINT only.
    pub fn interrupt() -> Self {
        Self::new([SignalKind::interrupt()])
    }
}

#[cfg(not(unix))]
impl SignalSource {
    /// Watch the interrupt signal (Ctrl-C), the only signal available here.
    pub fn interrupt() -> Self {
        Self {
            core: SourceCore::new("signal [interrupt]".to_string()),
        }
    }
}

#[async_trait]
impl CancelSource for SignalSource {
    fn description(&self) -> String {
        self.core.description().to_string()
    }

    fn triggered(&self) -> bool {
        self.core.triggered()
    }

    #[cfg(unix)]
    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;
        if self.kinds.is_empty() {
            return Err(UsageError::InvalidSource(
                "signal source needs at least one signal".to_string(),
            ));
        }

        for kind in &self.kinds {
            let raw = kind.as_raw_value();
            let mut stream = signal(*kind).map_err(|err| {
                UsageError::InvalidSource(format!("cannot install handler for signal {raw}: {err}"))
            })?;

            let token = scope.token().clone();
            let triggered = self.core.triggered_flag();
            let operation_id = scope.operation_id().to_string();

            self.core.push_monitor(MonitorTask::spawn(move |stop| async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    received = stream.recv() => {
                        if received.is_some() {
                            triggered.store(true, Ordering::Release);
                            tracing::debug!(operation_id = %operation_id, "signal {raw} received");
                            token
                                .cancel_with(CancelReason::Signal, format!("received signal {raw}"))
                                .await;
                        }
                    }
                }
            }));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn activate(&self, scope: &SourceScope) -> Result<(), UsageError> {
        self.core.try_activate()?;

        let token = scope.token().clone();
        let triggered = self.core.triggered_flag();

        self.core.push_monitor(MonitorTask::spawn(move |stop| async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        triggered.store(true, Ordering::Release);
                        token
                            .cancel_with(CancelReason::Signal, "received interrupt".to_string())
                            .await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stops the watchers most recently installed first, releasing each
    /// signal stream.
    async fn deactivate(&self) {
        self.core.stop_monitors().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::CallbackSet;
    use crate::token::CancelToken;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn scope(token: &CancelToken) -> SourceScope {
        SourceScope::new(
            "op-test".to_string(),
            token.clone(),
            Arc::new(Mutex::new(CallbackSet::default())),
        )
    }

    #[tokio::test]
    async fn empty_signal_set_is_rejected() {
        let token = CancelToken::new();
        let source = SignalSource::new([]);
        assert!(matches!(
            source.activate(&scope(&token)).await,
            Err(UsageError::InvalidSource(_))
        ));
    }

    #[tokio::test]
    async fn fires_on_delivered_signal() {
        let token = CancelToken::new();
        let source = SignalSource::new([SignalKind::user_defined1()]);
        source.activate(&scope(&token)).await.unwrap();

        // Give the watcher a moment to install, then signal ourselves.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pid = std::process::id();
        std::process::Command::new("kill")
            .args(["-USR1", &pid.to_string()])
            .status()
            .expect("kill should run");

        tokio::time::timeout(Duration::from_secs(2), token.wait())
            .await
            .expect("signal should cancel the token");
        assert_eq!(token.reason(), Some(CancelReason::Signal));
        assert!(source.triggered());
        source.deactivate().await;
    }

    #[tokio::test]
    async fn deactivation_releases_watcher() {
        let token = CancelToken::new();
        let source = SignalSource::new([SignalKind::user_defined2()]);
        source.activate(&scope(&token)).await.unwrap();
        source.deactivate().await;
        assert!(!source.triggered());
        assert!(!token.is_cancelled());
    }
}
