//! Bridge between the executor and the ambient tokio runtime.
//!
//! Async code cannot hold a context across an `.await` (a holder is bound to
//! a worker thread, not to a future), so the bridge works the other way
//! around: a per-task element records how closures dispatched from the
//! current async scope should be scheduled, and [`with_pinned_context`]
//! keeps a whole async block — everything after its suspension points
//! included — on one specific context.

use std::future::Future;

use crate::context::PinnedContext;
use crate::error::DispatchError;
use crate::executor::ContextExecutor;

tokio::task_local! {
    static DISPATCH_MODE: DispatchMode;
}

/// How closures dispatched from the current async scope reach the executor.
#[derive(Clone, Debug, Default)]
pub enum DispatchMode {
    /// Every dispatched closure runs on one specific context.
    Pinned(PinnedContext),
    /// The executor picks any pooled context.
    #[default]
    Unpinned,
    /// Context acquisition is bypassed; dispatched closures run directly on
    /// the backing worker pool, with no access to context-local state.
    Direct,
}

fn current_mode() -> DispatchMode {
    DISPATCH_MODE
        .try_with(|mode| mode.clone())
        .unwrap_or_default()
}

/// The pin installed by the nearest enclosing [`with_pinned_context`] scope,
/// if any.
pub fn current_pin() -> Option<PinnedContext> {
    match current_mode() {
        DispatchMode::Pinned(pin) => Some(pin),
        _ => None,
    }
}

/// Run `fut` with `mode` as its dispatch element. Nested scopes shadow outer
/// ones.
pub async fn with_dispatch_mode<Fut: Future>(mode: DispatchMode, fut: Fut) -> Fut::Output {
    DISPATCH_MODE.scope(mode, fut).await
}

/// Run `fut` with every dispatch pinned to `pin`'s context, guaranteeing the
/// same context serves the block before and after each of its suspension
/// points.
pub async fn with_pinned_context<Fut: Future>(pin: PinnedContext, fut: Fut) -> Fut::Output {
    with_dispatch_mode(DispatchMode::Pinned(pin), fut).await
}

/// Exposes a [`ContextExecutor`] as a scheduler for async code.
#[derive(Clone)]
pub struct Dispatcher {
    executor: ContextExecutor,
}

impl Dispatcher {
    pub fn new(executor: ContextExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ContextExecutor {
        &self.executor
    }

    /// Run `f` according to the ambient [`DispatchMode`] and await its
    /// result.
    pub async fn dispatch<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let handle = match current_mode() {
            DispatchMode::Pinned(pin) => self.executor.submit_pinned(&pin, f)?,
            DispatchMode::Unpinned => self.executor.submit(f)?,
            DispatchMode::Direct => self.executor.execute_direct(f)?,
        };
        Ok(handle.await?)
    }

    /// Spawn `fut` on the tokio runtime. The child inherits the caller's
    /// dispatch mode (task locals do not cross `spawn` on their own), unless
    /// it installs its own scope.
    pub fn spawn<Fut>(&self, fut: Fut) -> tokio::task::JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        tokio::spawn(DISPATCH_MODE.scope(current_mode(), fut))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::testing::test_executor;

    use super::*;

    #[tokio::test]
    async fn default_mode_is_unpinned() {
        let (executor, _factory) = test_executor(2, 2);
        let dispatcher = Dispatcher::new(executor.clone());

        let probe = executor.clone();
        let on_dispatch = dispatcher
            .dispatch(move || probe.on_dispatch_thread())
            .await
            .unwrap();

        assert!(on_dispatch);
        assert!(executor.pool_size() >= 1);
        executor.shutdown();
    }

    #[tokio::test]
    async fn pinned_scope_survives_suspension_points() {
        let (executor, _factory) = test_executor(2, 2);
        let dispatcher = Dispatcher::new(executor.clone());

        let pin = dispatcher
            .dispatch(|| PinnedContext::current().unwrap())
            .await
            .unwrap();

        let expected = pin.clone();
        let matched = with_pinned_context(pin, async {
            let first = dispatcher
                .dispatch(|| PinnedContext::current().unwrap())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let second = dispatcher
                .dispatch(|| PinnedContext::current().unwrap())
                .await
                .unwrap();
            first == expected && second == expected && current_pin() == Some(expected.clone())
        })
        .await;

        assert!(matched);
        assert_eq!(current_pin(), None);
        executor.shutdown();
    }

    #[tokio::test]
    async fn direct_mode_bypasses_contexts() {
        let (executor, factory) = test_executor(2, 2);
        let dispatcher = Dispatcher::new(executor.clone());

        let probe = executor.clone();
        let on_dispatch = with_dispatch_mode(DispatchMode::Direct, async {
            dispatcher
                .dispatch(move || probe.on_dispatch_thread())
                .await
                .unwrap()
        })
        .await;

        assert!(!on_dispatch);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        executor.shutdown();
    }

    #[tokio::test]
    async fn spawned_tasks_inherit_the_dispatch_mode() {
        let (executor, _factory) = test_executor(2, 2);
        let dispatcher = Dispatcher::new(executor.clone());

        let pin = dispatcher
            .dispatch(|| PinnedContext::current().unwrap())
            .await
            .unwrap();

        let expected = pin.clone();
        let child = with_pinned_context(pin, async {
            let inherited = dispatcher.clone();
            dispatcher.spawn(async move {
                inherited
                    .dispatch(|| PinnedContext::current().unwrap())
                    .await
                    .unwrap()
            })
        })
        .await;

        assert_eq!(child.await.unwrap(), expected);
        executor.shutdown();
    }
}
