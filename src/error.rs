//! Error types surfaced by the executor and its collaborators.

use thiserror::Error;

/// An opaque error produced by a collaborator (context factory or context
/// handle). The executor never inspects these; it only routes them.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The calling thread is not currently running a context-aware task.
///
/// Raised by [`ContextLocal`](crate::ContextLocal) accessors and
/// [`PinnedContext::current`](crate::PinnedContext::current) when there is no
/// active context on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no guest context is active on this thread")]
pub struct NoActiveContext;

/// A task could not be accepted for execution.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The executor (or its backing worker pool) has been shut down.
    #[error("executor is shut down")]
    Shutdown,
    /// The backing worker pool refused the task.
    #[error("backing worker pool rejected the task")]
    Rejected,
}

/// An accepted task failed to produce a result.
///
/// Resolved through the task's [`TaskHandle`](crate::TaskHandle); the executor
/// itself never retries a failed task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The context factory failed while populating a fresh pool slot. The
    /// slot is forfeit: it counts against the pool cap but is never used.
    #[error("context factory failed")]
    Factory(#[source] BoxError),
    /// The context could not be entered. The context is discarded.
    #[error("failed to enter guest context")]
    Enter(#[source] BoxError),
    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was discarded before it ran (executor shutdown, or its
    /// context became unusable).
    #[error("task was cancelled before it ran")]
    Cancelled,
}

/// Error returned by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch):
/// either the submission was refused or the task itself failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Task(#[from] TaskError),
}
