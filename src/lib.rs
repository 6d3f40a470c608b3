//! # cancelkit
//!
//! Scoped cancellation coordination for cooperative async code on tokio.
//! Heterogeneous cancellation triggers (deadlines, manual tokens, OS
//! signals, polled predicates) are unified behind one scoped primitive that
//! propagates cancellation into the running body, down to nested child
//! operations, and through wrapped streams. A thread-safe signalling path
//! lets plain OS threads cancel async work.
//!
//! ## Modules
//!
//! - **`token`**: [`CancelToken`], the thread-safe one-shot signal every
//!   cancellation flows through, with reasons, messages, callbacks, and
//!   linked (any-parent) composition.
//!
//! - **`sources`**: triggers installed into an operation (deadline,
//!   predicate poll, OS signal, external token), plus any-of and all-of
//!   combinators.
//!
//! - **`operation`**: the [`Operation`] scope itself: entry/exit lifecycle,
//!   child hierarchies, shielding, checked callables, progress reporting,
//!   and partial results.
//!
//! - **`stream`**: wrappers that make any stream observe the enclosing
//!   operation's cancellation between pulls or between chunks.
//!
//! - **`registry`**: the process-wide directory of live operations with
//!   glob-filtered listing, bulk cancel, and bounded history.
//!
//! - **`context`**: ambient [`current_operation`] lookup via task-local
//!   storage.
//!
//! - **`events`**: the callback plumbing ([`OperationEvent`], [`EventSink`])
//!   shared by progress and lifecycle notifications.
//!
//! - **`bridge`**: scheduling onto the runtime from foreign threads and
//!   offloading blocking work out of async code.
//!
//! ## Cancellation model
//!
//! Cancellation is cooperative. When an operation's token fires, the body
//! future is dropped at its next suspension point, so destructors run like
//! cleanup blocks, unless a shield guard is held, in which case delivery
//! waits for the guard to drop. Synchronous code observes cancellation only
//! at explicit checkpoints ([`CancelToken::check`], [`Operation::wrap`]); a
//! body that never suspends and never checks cannot be cancelled.
//!
//! ```no_run
//! use cancelkit::{Operation, RunError};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let op = Operation::with_deadline(Duration::from_millis(100))
//!     .name("slow-job")
//!     .build();
//! let result: Result<(), RunError<std::io::Error>> = op
//!     .run(async {
//!         tokio::time::sleep(Duration::from_secs(10)).await;
//!         Ok(())
//!     })
//!     .await;
//! assert!(result.is_err());
//! assert_eq!(op.reason(), Some(cancelkit::CancelReason::Timeout));
//! # }
//! ```

pub mod bridge;
pub mod context;
pub mod error;
pub mod events;
pub mod operation;
pub mod registry;
pub mod sources;
pub mod stream;
pub mod token;
pub mod utils;

pub use bridge::{RuntimeBridge, run_in_thread};
pub use context::current_operation;
pub use error::{CancelError, RunError, UsageError};
pub use events::{EventSink, Metadata, OperationEvent, channel_sink, logging_sink, noop_sink, sink_async, sink_fn};
pub use operation::{
    DEFAULT_SHUTDOWN_BUDGET, Operation, OperationBuilder, OperationSnapshot, OperationStatus,
    OperationWrapper, PartialResult, ShieldGuard,
};
pub use registry::{
    OperationFilter, OperationRegistry, RegistryConfig, SyncRegistryHandle, global_registry,
};
pub use sources::{
    AllOfSource, AnyOfSource, CancelSource, DeadlineSource, PredicateSource, SignalSource,
    SourceScope, TokenSource,
};
pub use token::{CancelReason, CancelToken};
