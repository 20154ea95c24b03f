//! Context-aware task execution for pooled guest-language interpreters.
//!
//! A guest context (an interpreter instance) is expensive to create, carries
//! mutable state, and must never be used by two tasks at once — yet distinct
//! contexts can run in parallel. The [`ContextExecutor`] coordinates exactly
//! that: it keeps a bounded pool of contexts that grows lazily on demand,
//! hands each context to at most one task at a time, and runs the tasks on a
//! backing [`WorkerPool`] for real OS-thread parallelism.
//!
//! Related tasks often have to share interpreter state. A task can capture a
//! [`PinnedContext`] for the context it is running on and schedule follow-up
//! work on that exact context with
//! [`submit_pinned`](ContextExecutor::submit_pinned); [`ContextLocal`] slots
//! store values on the context itself, so pinned successors see what their
//! predecessors left behind. For async code, [`Dispatcher`] and
//! [`with_pinned_context`] propagate the pin across suspension points.
//!
//! ```
//! use std::sync::Arc;
//! use guest_executor::{
//!     BoxError, ContextExecutor, ContextHandle, FixedThreadPool, PinnedContext,
//! };
//!
//! // A stand-in guest context; a real embedder wraps an interpreter here.
//! struct NullContext;
//!
//! impl ContextHandle for NullContext {
//!     fn enter(&self) -> Result<(), BoxError> { Ok(()) }
//!     fn leave(&self) {}
//!     fn close(&self, _cancel_running: bool) {}
//! }
//!
//! let pool = Arc::new(FixedThreadPool::new(2, "guest-worker"));
//! let executor = ContextExecutor::new(
//!     2,
//!     pool,
//!     || -> Result<Box<dyn ContextHandle>, BoxError> { Ok(Box::new(NullContext)) },
//! );
//!
//! // Unconfined: runs on any pooled context.
//! let pin = executor
//!     .submit(|| PinnedContext::current().unwrap())
//!     .unwrap()
//!     .join()
//!     .unwrap();
//!
//! // Confined: runs on exactly the context that ran the task above.
//! let same = executor
//!     .submit_pinned(&pin, || PinnedContext::current().unwrap())
//!     .unwrap()
//!     .join()
//!     .unwrap();
//! assert_eq!(pin, same);
//!
//! executor.shutdown();
//! ```

mod adapter;
mod context;
mod error;
mod executor;
mod local;
mod pool;

pub use adapter::{current_pin, with_dispatch_mode, with_pinned_context, DispatchMode, Dispatcher};
pub use context::{ContextFactory, ContextHandle, PinnedContext};
pub use error::{BoxError, DispatchError, NoActiveContext, SubmitError, TaskError};
pub use executor::{ContextExecutor, TaskHandle, UnstartedTask};
pub use pool::{FixedThreadPool, WorkerPool};
