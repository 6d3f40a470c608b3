//! Cancellation-aware stream wrappers.
//!
//! Wrapped streams check the operation's token before every pull (or between
//! chunks), yield one terminal cancellation error when the token has fired,
//! and optionally feed the operation's partial-result buffer and progress
//! callbacks along the way. Item order is preserved; nothing is reordered or
//! dropped.

use crate::error::CancelError;
use crate::events::Metadata;
use crate::operation::Operation;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

fn progress_metadata(count: u64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("current".to_string(), Value::from(count));
    metadata
}

/// A report interval of zero would report on every item and is almost
/// certainly a bug; treat it as "no reporting".
fn normalize_interval(report_interval: Option<usize>) -> Option<u64> {
    match report_interval {
        Some(0) => {
            tracing::warn!("stream report interval of 0 ignored");
            None
        }
        Some(every) => Some(every as u64),
        None => None,
    }
}

impl Operation {
    /// Wrap a stream so each pull first checks this operation's token.
    ///
    /// Once the token fires, the wrapper yields a single
    /// `Err(`[`CancelError`]`)` and then ends. With `report_interval`, a
    /// progress report carrying the running count (metadata key `current`)
    /// is emitted every N items.
    pub fn wrap_stream<S>(
        &self,
        stream: S,
        report_interval: Option<usize>,
    ) -> impl Stream<Item = Result<S::Item, CancelError>>
    where
        S: Stream + Send + 'static,
        S::Item: Send,
    {
        let interval = normalize_interval(report_interval);
        futures::stream::unfold(
            (Box::pin(stream), self.clone(), 0u64, false),
            move |(mut inner, op, mut count, done)| async move {
                if done {
                    return None;
                }
                if let Err(err) = op.token().check() {
                    op.mark_cancel_observed();
                    return Some((Err(err), (inner, op, count, true)));
                }
                let item = inner.next().await?;
                count += 1;
                if let Some(every) = interval
                    && count % every == 0
                {
                    let _ = op
                        .report_progress(
                            format!("processed {count} items"),
                            Some(progress_metadata(count)),
                        )
                        .await;
                }
                Some((Ok(item), (inner, op, count, false)))
            },
        )
    }

    /// [`Operation::wrap_stream`], additionally buffering every emitted item
    /// into the operation's partial result so intermediate output survives
    /// cancellation and remains readable after exit.
    pub fn wrap_stream_buffered<S>(
        &self,
        stream: S,
        report_interval: Option<usize>,
    ) -> impl Stream<Item = Result<S::Item, CancelError>>
    where
        S: Stream + Send + 'static,
        S::Item: Serialize + Send,
    {
        let interval = normalize_interval(report_interval);
        futures::stream::unfold(
            (Box::pin(stream), self.clone(), 0u64, false),
            move |(mut inner, op, mut count, done)| async move {
                if done {
                    return None;
                }
                if let Err(err) = op.token().check() {
                    op.mark_cancel_observed();
                    return Some((Err(err), (inner, op, count, true)));
                }
                let item = inner.next().await?;
                op.record_partial(serde_json::to_value(&item).unwrap_or(Value::Null));
                count += 1;
                if let Some(every) = interval
                    && count % every == 0
                {
                    let _ = op
                        .report_progress(
                            format!("processed {count} items"),
                            Some(progress_metadata(count)),
                        )
                        .await;
                }
                Some((Ok(item), (inner, op, count, false)))
            },
        )
    }

    /// Yield chunks of up to `chunk_size` items, checking the token between
    /// chunks rather than between individual items. Useful when per-item
    /// cost is small.
    pub fn wrap_stream_chunked<S>(
        &self,
        stream: S,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<Vec<S::Item>, CancelError>>
    where
        S: Stream + Send + 'static,
        S::Item: Send,
    {
        let size = chunk_size.max(1);
        futures::stream::unfold(
            (Box::pin(stream), self.clone(), false),
            move |(mut inner, op, done)| async move {
                if done {
                    return None;
                }
                if let Err(err) = op.token().check() {
                    op.mark_cancel_observed();
                    return Some((Err(err), (inner, op, true)));
                }
                let mut chunk = Vec::with_capacity(size);
                while chunk.len() < size {
                    match inner.next().await {
                        Some(item) => chunk.push(item),
                        None => break,
                    }
                }
                if chunk.is_empty() {
                    None
                } else {
                    Some((Ok(chunk), (inner, op, false)))
                }
            },
        )
    }
}
