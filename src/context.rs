//! Guest context capability traits and the executor's per-context state.
//!
//! A context is an expensive, stateful, non-reentrant resource (in the
//! originating system, a guest-language interpreter instance). The executor
//! never constructs or drives contexts itself; it goes through the narrow
//! [`ContextFactory`] and [`ContextHandle`] seams defined here.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::error::{BoxError, NoActiveContext};

/// A non-reentrant guest execution context.
///
/// A context may only be used by one thread at a time: `enter` binds it to the
/// calling thread and must be paired with `leave` on the same thread before
/// any other thread may enter it. The executor upholds this pairing; handle
/// implementations may assume it.
pub trait ContextHandle: Send + Sync + 'static {
    /// Bind the context to the calling thread.
    fn enter(&self) -> Result<(), BoxError>;

    /// Release the thread binding established by [`enter`](Self::enter).
    fn leave(&self);

    /// Dispose of the context. With `cancel_running` set, any guest code
    /// currently executing in the context should be interrupted. May be
    /// called from a thread other than the one the context is entered on.
    /// After `close` returns, no other operation will be invoked.
    fn close(&self, cancel_running: bool);
}

/// Produces new guest contexts on demand.
///
/// Called on worker threads, at most once per pool slot: context construction
/// is deliberately deferred off the submitting thread because it is expensive.
pub trait ContextFactory: Send + Sync + 'static {
    fn new_context(&self) -> Result<Box<dyn ContextHandle>, BoxError>;
}

impl<F> ContextFactory for F
where
    F: Fn() -> Result<Box<dyn ContextHandle>, BoxError> + Send + Sync + 'static,
{
    fn new_context(&self) -> Result<Box<dyn ContextHandle>, BoxError> {
        (self)()
    }
}

// Process-unique tags for holder identity and context-local keys.
static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_tag() -> u64 {
    let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
    // Detect overflow
    assert!(tag != u64::MAX);
    tag
}

/// Pairs a guest context with its per-context local storage.
///
/// A holder is either free (sitting in the executor's pool) or in use by
/// exactly one worker thread. Its context is created by the factory on the
/// worker thread that first runs on the holder, not when the holder is
/// allocated.
pub(crate) struct ContextHolder {
    id: u64,
    context: OnceCell<Box<dyn ContextHandle>>,
    /// Keyed by [`ContextLocal`](crate::ContextLocal) tag. Only the worker
    /// currently using the holder touches the map; the mutex exists so the
    /// holder can be shared across threads at all.
    locals: Mutex<HashMap<u64, Box<dyn Any + Send>>>,
}

impl ContextHolder {
    pub(crate) fn new() -> Self {
        Self {
            id: next_tag(),
            context: OnceCell::new(),
            locals: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped context, if a worker has initialized it yet.
    pub(crate) fn context(&self) -> Option<&dyn ContextHandle> {
        self.context.get().map(|c| c.as_ref())
    }

    pub(crate) fn init_context(&self, context: Box<dyn ContextHandle>) {
        let res = self.context.set(context);
        assert!(res.is_ok(), "holder context initialized twice");
    }

    pub(crate) fn locals(&self) -> &Mutex<HashMap<u64, Box<dyn Any + Send>>> {
        &self.locals
    }
}

impl fmt::Debug for ContextHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHolder")
            .field("id", &self.id)
            .field("initialized", &self.context.get().is_some())
            .finish()
    }
}

// thread-local state
std::thread_local! {
    // The holder (if any) that this thread is currently running a task on.
    // Set for exactly the dynamic extent of a context-aware task.
    static ACTIVE_HOLDER: RefCell<Option<Arc<ContextHolder>>> = const { RefCell::new(None) };
}

/// Install `holder` as the calling thread's active holder.
pub(crate) fn set_active_holder(holder: Arc<ContextHolder>) {
    ACTIVE_HOLDER.with(|h| {
        let old = h.borrow_mut().replace(holder);
        debug_assert!(old.is_none(), "a task is already active on this thread");
    });
}

/// Clear and return the calling thread's active holder.
pub(crate) fn take_active_holder() -> Option<Arc<ContextHolder>> {
    ACTIVE_HOLDER.with(|h| h.borrow_mut().take())
}

/// Run `f` with the calling thread's active holder, or `None` if the thread
/// is not running a context-aware task.
pub(crate) fn with_active_holder<F, R>(f: F) -> R
where
    F: FnOnce(Option<&Arc<ContextHolder>>) -> R,
{
    ACTIVE_HOLDER.with(|h| f(h.borrow().as_ref()))
}

/// An opaque reference to the specific context running the current task.
///
/// Obtainable only from code executing inside a context-aware task, via
/// [`current`](Self::current). Passing the pin to
/// [`ContextExecutor::submit_pinned`](crate::ContextExecutor::submit_pinned)
/// schedules a task on that exact context and no other, which is how related
/// work stays on one interpreter across suspension points.
///
/// Pins compare by context identity: two pins are equal iff they reference the
/// same pool slot, regardless of which tasks produced them.
#[derive(Clone)]
pub struct PinnedContext {
    holder: Arc<ContextHolder>,
}

impl PinnedContext {
    /// The pin for the context the calling thread is currently running on.
    pub fn current() -> Result<Self, NoActiveContext> {
        with_active_holder(|h| h.cloned())
            .map(|holder| Self { holder })
            .ok_or(NoActiveContext)
    }

    pub(crate) fn holder(&self) -> &Arc<ContextHolder> {
        &self.holder
    }
}

impl PartialEq for PinnedContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.holder, &other.holder)
    }
}

impl Eq for PinnedContext {}

impl std::hash::Hash for PinnedContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.holder.id().hash(state);
    }
}

impl fmt::Debug for PinnedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PinnedContext").field(&self.holder.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tags_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| next_tag()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for tag in handle.join().unwrap() {
                assert!(seen.insert(tag));
            }
        }
    }

    #[test]
    fn current_pin_requires_active_task() {
        assert_eq!(PinnedContext::current(), Err(NoActiveContext));
    }

    #[test]
    #[should_panic]
    fn holder_context_cannot_be_initialized_twice() {
        let holder = ContextHolder::new();
        holder.init_context(Box::new(crate::testing::TestContext::detached()));
        holder.init_context(Box::new(crate::testing::TestContext::detached()));
    }

    #[test]
    fn fresh_holder_reports_uninitialized() {
        let holder = ContextHolder::new();
        assert!(holder.context().is_none());
        assert!(format!("{holder:?}").contains("initialized: false"));
    }
}
