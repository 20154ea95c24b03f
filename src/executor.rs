//! The context-aware executor core.
//!
//! The executor owns a bounded, lazily grown pool of context holders and two
//! task queues: an unconfined FIFO served by any holder, and per-context
//! confined FIFOs for tasks pinned to one specific holder. A single lock
//! guards all of that state; the lock is only ever held for bounded,
//! non-blocking bookkeeping, while tasks themselves run outside it on the
//! backing [`WorkerPool`](crate::WorkerPool).
//!
//! Scheduling is a drain pass that runs after every enqueue and after every
//! holder return: confined tasks are matched with their holder first (they
//! cannot be served by any other holder, so a free holder with confined work
//! must not be claimed by unconfined work), then unconfined tasks take free
//! holders in LIFO order, then the pool grows up to its cap if unconfined
//! work is still waiting.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::oneshot;

use crate::context::{
    set_active_holder, take_active_holder, with_active_holder, ContextFactory, ContextHolder,
    PinnedContext,
};
use crate::error::{SubmitError, TaskError};
use crate::pool::WorkerPool;

/// Completion side of a submitted task: either runs the body or fails the
/// task's handle without running it.
trait Runnable: Send {
    fn run(self: Box<Self>);
    fn fail(self: Box<Self>, error: TaskError);
}

type Job = Box<dyn Runnable>;

struct Submission<F, R> {
    body: F,
    tx: oneshot::Sender<Result<R, TaskError>>,
}

impl<F, R> Runnable for Submission<F, R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    fn run(self: Box<Self>) {
        let result = panic::catch_unwind(AssertUnwindSafe(self.body))
            .map_err(|payload| TaskError::Panicked(panic_message(&*payload)));
        // the submitter may have dropped its handle; that's not our problem
        let _ = self.tx.send(result);
    }

    fn fail(self: Box<Self>, error: TaskError) {
        let _ = self.tx.send(Err(error));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn make_job<F, R>(f: F) -> (Job, TaskHandle<R>)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    (Box::new(Submission { body: f, tx }), TaskHandle { rx })
}

/// The pending result of a submitted task.
///
/// Await it from async code, or [`join`](Self::join) from a plain thread.
/// If the task is discarded before running (executor shutdown, backing pool
/// rejection) the handle resolves to [`TaskError::Cancelled`].
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<Result<R, TaskError>>,
}

impl<R> TaskHandle<R> {
    /// Block until the task resolves. Must not be called from async code.
    pub fn join(self) -> Result<R, TaskError> {
        self.rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(TaskError::Cancelled)))
    }
}

/// A task reclaimed by [`ContextExecutor::shutdown_now`] before it was
/// dispatched. Dropping it resolves the task's handle to
/// [`TaskError::Cancelled`].
pub struct UnstartedTask {
    _job: Job,
}

impl fmt::Debug for UnstartedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnstartedTask")
    }
}

struct ExecState {
    /// Free holders; most recently returned last, so `pop` hands out the
    /// warmest context first.
    free: Vec<Arc<ContextHolder>>,
    /// Every holder ever created. Bounded by `max_contexts`; this is the
    /// pool size in the "free + in-use (+ forfeited)" sense.
    all: Vec<Arc<ContextHolder>>,
    /// FIFO of tasks that may run on any holder.
    unconfined: VecDeque<Job>,
    /// Per-holder FIFO of tasks pinned to that holder, keyed by holder id.
    /// A queue is removed as soon as it becomes empty.
    confined: HashMap<u64, VecDeque<Job>>,
    /// Running total of queued confined tasks.
    confined_len: usize,
    shutdown: bool,
}

struct Inner {
    state: Mutex<ExecState>,
    worker_pool: Arc<dyn WorkerPool>,
    factory: Box<dyn ContextFactory>,
    max_contexts: usize,
}

/// Context-aware task executor.
///
/// Coordinates dispatch of arbitrary closures across a bounded pool of
/// non-reentrant guest contexts: every context is used by at most one task at
/// a time, distinct contexts run in parallel on the backing worker pool, and
/// a task holding a [`PinnedContext`] can insist on one specific context.
///
/// The executor is a cheap handle; clones share the same pool and queues.
#[derive(Clone)]
pub struct ContextExecutor {
    inner: Arc<Inner>,
}

impl ContextExecutor {
    /// A new executor over `worker_pool`, growing up to `max_context_pool_size`
    /// contexts produced by `factory`.
    ///
    /// Contexts are created lazily, on the worker thread that first needs
    /// them, never at construction time.
    pub fn new(
        max_context_pool_size: usize,
        worker_pool: Arc<dyn WorkerPool>,
        factory: impl ContextFactory,
    ) -> Self {
        assert!(
            max_context_pool_size >= 1,
            "context pool must allow at least one context"
        );
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ExecState {
                    free: Vec::new(),
                    all: Vec::new(),
                    unconfined: VecDeque::new(),
                    confined: HashMap::new(),
                    confined_len: 0,
                    shutdown: false,
                }),
                worker_pool,
                factory: Box::new(factory),
                max_contexts: max_context_pool_size,
            }),
        }
    }

    /// Schedule `f` on any free (or newly created) context.
    pub fn submit<F, R>(&self, f: F) -> Result<TaskHandle<R>, SubmitError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (job, handle) = make_job(f);
        self.enqueue(job, None)?;
        Ok(handle)
    }

    /// Schedule `f` on exactly the context identified by `pin`.
    ///
    /// The task waits until that context is free, even while other contexts
    /// sit idle; tasks pinned to the same context run in submission order.
    pub fn submit_pinned<F, R>(&self, pin: &PinnedContext, f: F) -> Result<TaskHandle<R>, SubmitError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (job, handle) = make_job(f);
        self.enqueue(job, Some(pin.holder().id()))?;
        Ok(handle)
    }

    /// Run `f` on the backing worker pool without acquiring a context.
    ///
    /// The task has no active holder: context locals and
    /// [`PinnedContext::current`] fail inside it. Meant for blocking work
    /// that does not touch guest state.
    pub fn execute_direct<F, R>(&self, f: F) -> Result<TaskHandle<R>, SubmitError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.state.lock().unwrap().shutdown {
            return Err(SubmitError::Shutdown);
        }
        let (job, handle) = make_job(f);
        self.inner.worker_pool.execute(Box::new(move || job.run()))?;
        Ok(handle)
    }

    /// Ask the pool to create up to `count` contexts ahead of demand by
    /// scheduling that many no-op tasks.
    pub fn prewarm(&self, count: usize) -> Result<(), SubmitError> {
        for _ in 0..count {
            self.submit(|| ())?;
        }
        Ok(())
    }

    /// Refuse new submissions, cancel still-queued tasks, close every context
    /// created so far (interrupting running guest code), and shut down the
    /// backing pool. Does not wait for running tasks.
    pub fn shutdown(&self) {
        // dropping the reclaimed jobs resolves their handles as cancelled
        drop(self.shutdown_internal(false));
    }

    /// As [`shutdown`](Self::shutdown), but queued jobs are discarded on the
    /// backing pool too, and the tasks that never started are handed back.
    pub fn shutdown_now(&self) -> Vec<UnstartedTask> {
        self.shutdown_internal(true)
            .into_iter()
            .map(|job| UnstartedTask { _job: job })
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().unwrap().shutdown || self.inner.worker_pool.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.worker_pool.is_terminated()
    }

    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.worker_pool.await_termination(timeout)
    }

    /// True iff the calling thread is currently running a context-aware task.
    pub fn on_dispatch_thread(&self) -> bool {
        with_active_holder(|h| h.is_some())
    }

    /// Number of contexts ever created for this executor, free and in use.
    /// Never exceeds the configured maximum.
    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().unwrap().all.len()
    }

    /// Number of holders currently sitting idle in the pool.
    pub fn free_contexts(&self) -> usize {
        self.inner.state.lock().unwrap().free.len()
    }

    fn enqueue(&self, job: Job, pin: Option<u64>) -> Result<(), SubmitError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return Err(SubmitError::Shutdown);
        }
        match pin {
            Some(holder_id) => {
                debug_assert!(
                    state.all.iter().any(|h| h.id() == holder_id),
                    "pin does not belong to this executor"
                );
                state.confined.entry(holder_id).or_default().push_back(job);
                state.confined_len += 1;
            }
            None => state.unconfined.push_back(job),
        }
        self.drain(&mut state);
        Ok(())
    }

    /// Move as many queued tasks as possible onto the worker pool. Called
    /// with the state lock held; nothing here blocks.
    fn drain(&self, state: &mut ExecState) {
        if state.shutdown {
            return;
        }

        // Confined tasks first: each can only ever run on its own holder.
        // Holders without confined work are left in place for the passes
        // below.
        let mut idx = 0;
        while idx < state.free.len() {
            let holder_id = state.free[idx].id();
            let popped = match state.confined.get_mut(&holder_id) {
                Some(queue) => {
                    let job = queue.pop_front();
                    let now_empty = queue.is_empty();
                    job.map(|job| (job, now_empty))
                }
                None => None,
            };
            let Some((job, now_empty)) = popped else {
                idx += 1;
                continue;
            };
            if now_empty {
                state.confined.remove(&holder_id);
            }
            state.confined_len -= 1;
            let holder = state.free.remove(idx);
            self.dispatch(state, job, holder);
        }

        // Unconfined tasks onto free holders, most recently returned first.
        while !state.free.is_empty() && !state.unconfined.is_empty() {
            let holder = state.free.pop().unwrap();
            let job = state.unconfined.pop_front().unwrap();
            self.dispatch(state, job, holder);
        }

        // Work still waiting: grow the pool up to the cap. The holder is
        // registered here; its context is created by the worker that first
        // runs on it.
        while !state.unconfined.is_empty() && state.all.len() < self.inner.max_contexts {
            let holder = Arc::new(ContextHolder::new());
            state.all.push(Arc::clone(&holder));
            trace!(
                "growing context pool to {} (max {})",
                state.all.len(),
                self.inner.max_contexts
            );
            let job = state.unconfined.pop_front().unwrap();
            self.dispatch(state, job, holder);
        }
    }

    /// Hand `(job, holder)` to the backing pool. Called with the state lock
    /// held; submission to the pool never blocks.
    fn dispatch(&self, state: &mut ExecState, job: Job, holder: Arc<ContextHolder>) {
        let executor = self.clone();
        let task_holder = Arc::clone(&holder);
        let submitted = self
            .inner
            .worker_pool
            .execute(Box::new(move || executor.run_on_holder(job, task_holder)));
        if submitted.is_err() {
            // The backing pool is gone; the dropped job resolves its handle
            // as cancelled. Keep the holder reachable for shutdown.
            warn!("backing worker pool rejected a dispatched task");
            state.free.push(holder);
        }
    }

    /// Runs on a worker thread: bind the holder to this thread, make sure its
    /// context exists, enter, run the task, leave, and return the holder.
    fn run_on_holder(&self, job: Job, holder: Arc<ContextHolder>) {
        if self.inner.state.lock().unwrap().shutdown {
            // Shutdown already closed (or will never learn about) this
            // context; don't touch it.
            job.fail(TaskError::Cancelled);
            return;
        }

        // Create the context on first use of this holder.
        if holder.context().is_none() {
            match self.inner.factory.new_context() {
                Ok(context) => holder.init_context(context),
                Err(e) => {
                    // The slot stays reserved ("forfeit"): a failing factory
                    // may be nondeterministic and must not be retried here.
                    warn!("context factory failed; forfeiting pool slot: {e}");
                    job.fail(TaskError::Factory(e));
                    return;
                }
            }
        }

        let context = holder.context().expect("holder context was just initialized");

        if let Err(e) = context.enter() {
            warn!("failed to enter guest context; discarding it: {e}");
            context.close(false);
            job.fail(TaskError::Enter(e));
            // Tasks already pinned to this holder can never run now.
            let orphaned = {
                let mut state = self.inner.state.lock().unwrap();
                let queue = state.confined.remove(&holder.id());
                if let Some(queue) = &queue {
                    state.confined_len -= queue.len();
                }
                queue
            };
            for pinned in orphaned.into_iter().flatten() {
                pinned.fail(TaskError::Cancelled);
            }
            return;
        }

        set_active_holder(Arc::clone(&holder));
        job.run(); // panics are captured inside and routed to the handle
        let previous = take_active_holder();
        debug_assert!(previous.is_some(), "active holder vanished mid-task");
        context.leave();

        // Return the holder and re-drain in one critical section, so a task
        // queued while we ran claims this holder before anything else can.
        let mut state = self.inner.state.lock().unwrap();
        state.free.push(holder);
        self.drain(&mut state);
    }

    fn shutdown_internal(&self, now: bool) -> Vec<Job> {
        let (holders, jobs) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                (Vec::new(), Vec::new())
            } else {
                state.shutdown = true;
                let mut jobs: Vec<Job> = state.unconfined.drain(..).collect();
                // deterministic order: confined queues by holder creation
                let ids: Vec<u64> = state.all.iter().map(|h| h.id()).collect();
                for id in ids {
                    if let Some(queue) = state.confined.remove(&id) {
                        jobs.extend(queue);
                    }
                }
                debug_assert!(state.confined.is_empty());
                state.confined_len = 0;
                debug!(
                    "shutting down: closing {} contexts, reclaiming {} queued tasks",
                    state.all.len(),
                    jobs.len()
                );
                (state.all.clone(), jobs)
            }
        };

        // Close outside the lock: close(cancel_running = true) may signal a
        // guest that is mid-execution.
        for holder in &holders {
            if let Some(context) = holder.context() {
                context.close(true);
            }
        }

        if now {
            self.inner.worker_pool.shutdown_now();
        } else {
            self.inner.worker_pool.shutdown();
        }

        jobs
    }
}

impl fmt::Debug for ContextExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("ContextExecutor")
            .field("max_contexts", &self.inner.max_contexts)
            .field("pool_size", &state.all.len())
            .field("free", &state.free.len())
            .field("pending_unconfined", &state.unconfined.len())
            .field("pending_confined", &state.confined_len)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
