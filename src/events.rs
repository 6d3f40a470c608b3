//! Lifecycle and progress event plumbing for operations.
//!
//! Operations announce what happens to them through [`OperationEvent`] values
//! delivered to registered [`EventSink`]s. Sinks are deliberately small: a
//! closure adapter for quick cases, a channel sink for decoupled consumers,
//! and a logging sink for debugging. A failing sink is logged and skipped;
//! it never disturbs the operation's lifecycle or the other sinks.

use crate::token::CancelReason;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// String-keyed metadata attached to progress reports and operations.
///
/// Recognized advisory keys: `progress` (0-100), `current`, `total`, `rate`,
/// `eta`, `phase`. All are optional.
pub type Metadata = Map<String, Value>;

/// A lifecycle or progress notification emitted by an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OperationEvent {
    /// The operation entered its scope.
    Started {
        operation_id: String,
        name: Option<String>,
    },
    /// A progress report from inside the scope.
    Progress {
        operation_id: String,
        message: String,
        metadata: Metadata,
    },
    /// The operation exited without cancellation or error.
    Completed {
        operation_id: String,
        duration_ms: u64,
    },
    /// The operation exited because its token fired.
    Cancelled {
        operation_id: String,
        reason: CancelReason,
        message: String,
        duration_ms: u64,
    },
    /// The operation exited with a non-cancellation error.
    Failed {
        operation_id: String,
        error: String,
        duration_ms: u64,
    },
    /// A cancellation source's monitor task failed; the operation continues.
    SourceFailed {
        operation_id: String,
        source: String,
        error: String,
    },
}

impl OperationEvent {
    /// The id of the operation this event belongs to.
    pub fn operation_id(&self) -> &str {
        match self {
            OperationEvent::Started { operation_id, .. }
            | OperationEvent::Progress { operation_id, .. }
            | OperationEvent::Completed { operation_id, .. }
            | OperationEvent::Cancelled { operation_id, .. }
            | OperationEvent::Failed { operation_id, .. }
            | OperationEvent::SourceFailed { operation_id, .. } => operation_id,
        }
    }
}

impl fmt::Display for OperationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationEvent::Started { operation_id, name } => match name {
                Some(name) => write!(f, "[{operation_id}] Started: {name}"),
                None => write!(f, "[{operation_id}] Started"),
            },
            OperationEvent::Progress {
                operation_id,
                message,
                metadata,
            } => {
                if metadata.is_empty() {
                    write!(f, "[{operation_id}] Progress: {message}")
                } else {
                    write!(
                        f,
                        "[{operation_id}] Progress: {message} {}",
                        Value::Object(metadata.clone())
                    )
                }
            }
            OperationEvent::Completed {
                operation_id,
                duration_ms,
            } => {
                write!(f, "[{operation_id}] Completed in {duration_ms}ms")
            }
            OperationEvent::Cancelled {
                operation_id,
                reason,
                message,
                duration_ms,
            } => {
                write!(
                    f,
                    "[{operation_id}] Cancelled ({reason}) after {duration_ms}ms: {message}"
                )
            }
            OperationEvent::Failed {
                operation_id,
                error,
                duration_ms,
            } => {
                write!(f, "[{operation_id}] Failed after {duration_ms}ms: {error}")
            }
            OperationEvent::SourceFailed {
                operation_id,
                source,
                error,
            } => {
                write!(f, "[{operation_id}] Source failed: {source}: {error}")
            }
        }
    }
}

/// Errors a sink can report back. Sink failures are isolated: the dispatcher
/// logs them and moves on to the next sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("event receiver disconnected")]
    Disconnected,
    #[error("event sink failed: {0}")]
    Failed(String),
}

/// Receiver of operation events.
///
/// Implementations must be cheap to call; anything expensive belongs behind a
/// channel ([`channel_sink`]).
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn send(&self, event: OperationEvent) -> Result<(), SinkError>;
}

/// Adapter turning a synchronous closure into an [`EventSink`].
pub struct FnSink<F>(F);

#[async_trait]
impl<F> EventSink for FnSink<F>
where
    F: Fn(&OperationEvent) + Send + Sync,
{
    async fn send(&self, event: OperationEvent) -> Result<(), SinkError> {
        (self.0)(&event);
        Ok(())
    }
}

/// Adapter turning an async closure into an [`EventSink`].
pub struct AsyncFnSink<F>(F);

#[async_trait]
impl<F> EventSink for AsyncFnSink<F>
where
    F: Fn(OperationEvent) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn send(&self, event: OperationEvent) -> Result<(), SinkError> {
        (self.0)(event).await;
        Ok(())
    }
}

/// Channel-based sink for consumers that process events elsewhere.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<OperationEvent>,
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: OperationEvent) -> Result<(), SinkError> {
        self.sender
            .send(event)
            .map_err(|_| SinkError::Disconnected)
    }
}

/// Sink that writes events to the log at debug level.
pub struct LoggingSink;

#[async_trait]
impl EventSink for LoggingSink {
    async fn send(&self, event: OperationEvent) -> Result<(), SinkError> {
        tracing::debug!("{event}");
        Ok(())
    }
}

/// Sink that drops every event.
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn send(&self, _event: OperationEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Wrap a synchronous closure as a sink.
pub fn sink_fn(f: impl Fn(&OperationEvent) + Send + Sync + 'static) -> Arc<dyn EventSink> {
    Arc::new(FnSink(f))
}

/// Wrap an async closure as a sink.
pub fn sink_async<F, Fut>(f: F) -> Arc<dyn EventSink>
where
    F: Fn(OperationEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncFnSink(move |event| {
        Box::pin(f(event)) as BoxFuture<'static, ()>
    }))
}

/// Create a channel sink together with its receiver.
pub fn channel_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<OperationEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Arc::new(ChannelSink { sender }), receiver)
}

/// Create a sink that logs every event.
pub fn logging_sink() -> Arc<dyn EventSink> {
    Arc::new(LoggingSink)
}

/// Create a sink that ignores every event.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopSink)
}

/// Per-kind callback registrations held by an operation. Registration order
/// is invocation order within each kind.
#[derive(Default)]
pub(crate) struct CallbackSet {
    pub(crate) start: Vec<Arc<dyn EventSink>>,
    pub(crate) progress: Vec<Arc<dyn EventSink>>,
    pub(crate) complete: Vec<Arc<dyn EventSink>>,
    pub(crate) cancel: Vec<Arc<dyn EventSink>>,
    pub(crate) error: Vec<Arc<dyn EventSink>>,
}

/// Deliver one event to each sink in order, isolating failures.
pub(crate) async fn dispatch(sinks: &[Arc<dyn EventSink>], event: &OperationEvent) {
    for sink in sinks {
        if let Err(err) = sink.send(event.clone()).await {
            tracing::warn!(
                operation_id = event.operation_id(),
                "event sink failed: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn display_formats_are_stable() {
        let started = OperationEvent::Started {
            operation_id: "op_1".to_string(),
            name: Some("reindex".to_string()),
        };
        assert_eq!(format!("{started}"), "[op_1] Started: reindex");

        let progress = OperationEvent::Progress {
            operation_id: "op_1".to_string(),
            message: "halfway".to_string(),
            metadata: Metadata::new(),
        };
        assert_eq!(format!("{progress}"), "[op_1] Progress: halfway");

        let cancelled = OperationEvent::Cancelled {
            operation_id: "op_1".to_string(),
            reason: CancelReason::Timeout,
            message: "deadline".to_string(),
            duration_ms: 120,
        };
        assert_eq!(
            format!("{cancelled}"),
            "[op_1] Cancelled (timeout) after 120ms: deadline"
        );
    }

    #[tokio::test]
    async fn channel_sink_delivers_events() {
        let (sink, mut receiver) = channel_sink();
        sink.send(OperationEvent::Completed {
            operation_id: "op_2".to_string(),
            duration_ms: 5,
        })
        .await
        .unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.operation_id(), "op_2");
    }

    #[tokio::test]
    async fn channel_sink_reports_disconnect() {
        let (sink, receiver) = channel_sink();
        drop(receiver);
        let result = sink
            .send(OperationEvent::Completed {
                operation_id: "op_3".to_string(),
                duration_ms: 1,
            })
            .await;
        assert!(matches!(result, Err(SinkError::Disconnected)));
    }

    #[tokio::test]
    async fn dispatch_isolates_failing_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (dead, receiver) = channel_sink();
        drop(receiver);
        let s = seen.clone();
        let live = sink_fn(move |event| s.lock().unwrap().push(event.operation_id().to_string()));

        let event = OperationEvent::Completed {
            operation_id: "op_4".to_string(),
            duration_ms: 9,
        };
        dispatch(&[dead, live], &event).await;
        assert_eq!(*seen.lock().unwrap(), vec!["op_4".to_string()]);
    }

    #[tokio::test]
    async fn serde_roundtrip_for_events() {
        let event = OperationEvent::Cancelled {
            operation_id: "op_5".to_string(),
            reason: CancelReason::Parent,
            message: "parent stopped".to_string(),
            duration_ms: 44,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: OperationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.operation_id(), "op_5");
        assert!(json.contains("\"parent\""));
    }
}
