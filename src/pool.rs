//! Backing worker pools.
//!
//! The executor core never spawns threads of its own; it hands every
//! dispatched task to a [`WorkerPool`], which provides the actual OS-thread
//! parallelism. [`FixedThreadPool`] is the bundled implementation; embedders
//! with their own threading can implement the trait instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use log::trace;

use crate::error::SubmitError;

/// A unit of work for a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The thread pool that runs dispatched tasks.
///
/// Lifecycle mirrors a classical executor service: `shutdown` stops intake
/// but lets queued jobs finish, `shutdown_now` additionally discards the
/// queue, and termination means every pool thread has exited.
pub trait WorkerPool: Send + Sync + 'static {
    /// Hand `job` to a pool thread. Must not block the caller.
    fn execute(&self, job: Job) -> Result<(), SubmitError>;

    /// Stop accepting jobs; already-queued jobs still run.
    fn shutdown(&self);

    /// Stop accepting jobs and discard queued jobs once the currently running
    /// ones finish.
    fn shutdown_now(&self);

    fn is_shutdown(&self) -> bool;

    /// True once every pool thread has exited.
    fn is_terminated(&self) -> bool;

    /// Wait up to `timeout` for every pool thread to exit. Returns whether
    /// termination was reached.
    fn await_termination(&self, timeout: Duration) -> bool;
}

/// A fixed-size pool of named worker threads fed from a shared queue.
pub struct FixedThreadPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    /// `None` once the pool has been shut down.
    sender: Mutex<Option<Sender<Job>>>,
    /// Set by `shutdown_now` so threads stop draining the queue.
    interrupt: AtomicBool,
    exit: ExitLatch,
}

/// Counts live threads so `await_termination` can wait for zero.
struct ExitLatch {
    live: Mutex<usize>,
    cond: Condvar,
}

impl ExitLatch {
    fn count_down(&self) {
        let mut live = self.live.lock().unwrap();
        *live -= 1;
        if *live == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let live = self.live.lock().unwrap();
        let (live, _result) = self
            .cond
            .wait_timeout_while(live, timeout, |live| *live > 0)
            .unwrap();
        *live == 0
    }

    fn is_zero(&self) -> bool {
        *self.live.lock().unwrap() == 0
    }
}

impl FixedThreadPool {
    /// A pool with `num_threads` worker threads named after `thread_name`.
    pub fn new(num_threads: usize, thread_name: &str) -> Self {
        assert!(num_threads > 0);

        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();

        let shared = Arc::new(PoolShared {
            sender: Mutex::new(Some(sender)),
            interrupt: AtomicBool::new(false),
            exit: ExitLatch {
                live: Mutex::new(num_threads),
                cond: Condvar::new(),
            },
        });

        for i in 0..num_threads {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);

            std::thread::Builder::new()
                .name(format!("{thread_name}-{i}"))
                .spawn(move || {
                    work_loop(&receiver, &shared);
                    shared.exit.count_down();
                })
                .unwrap();
        }

        Self { shared }
    }
}

fn work_loop(receiver: &Receiver<Job>, shared: &PoolShared) {
    while let Ok(job) = receiver.recv() {
        // a job received after shutdown_now is discarded, not run
        if shared.interrupt.load(Ordering::Relaxed) {
            break;
        }
        job();
    }
    trace!(
        "worker thread {:?} exiting",
        std::thread::current().name().unwrap_or("?")
    );
}

impl WorkerPool for FixedThreadPool {
    fn execute(&self, job: Job) -> Result<(), SubmitError> {
        match self.shared.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(job).map_err(|_| SubmitError::Rejected),
            None => Err(SubmitError::Shutdown),
        }
    }

    fn shutdown(&self) {
        // dropping the sender disconnects the channel once the queue drains
        self.shared.sender.lock().unwrap().take();
    }

    fn shutdown_now(&self) {
        self.shared.interrupt.store(true, Ordering::Relaxed);
        self.shared.sender.lock().unwrap().take();
    }

    fn is_shutdown(&self) -> bool {
        self.shared.sender.lock().unwrap().is_none()
    }

    fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.shared.exit.is_zero()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.shared.exit.wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_jobs_on_worker_threads() {
        let pool = FixedThreadPool::new(4, "test-worker");
        let counter = Arc::new(AtomicU32::new(0));
        let (done_send, done_recv) = mpsc::channel();

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let done_send = done_send.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done_send.send(()).unwrap();
            }))
            .unwrap();
        }

        for _ in 0..8 {
            done_recv.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
    }

    #[test]
    fn shutdown_still_runs_queued_jobs() {
        let pool = FixedThreadPool::new(1, "test-worker");
        let counter = Arc::new(AtomicU32::new(0));
        let (started_send, started_recv) = mpsc::channel();
        let (gate_send, gate_recv) = mpsc::channel::<()>();

        {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                started_send.send(()).unwrap();
                gate_recv.recv().unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        started_recv.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.execute(Box::new(|| ())).is_err());

        gate_send.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn shutdown_now_discards_queued_jobs() {
        let pool = FixedThreadPool::new(1, "test-worker");
        let counter = Arc::new(AtomicU32::new(0));
        let (started_send, started_recv) = mpsc::channel();
        let (gate_send, gate_recv) = mpsc::channel::<()>();

        {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                started_send.send(()).unwrap();
                gate_recv.recv().unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        started_recv.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        pool.shutdown_now();
        gate_send.send(()).unwrap();

        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn await_termination_times_out_while_running() {
        let pool = FixedThreadPool::new(2, "test-worker");
        assert!(!pool.await_termination(Duration::from_millis(10)));
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }
}
