//! Per-context local storage.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::context::{next_tag, with_active_holder};
use crate::error::NoActiveContext;

/// A typed slot in the storage of whichever context is running the current
/// task.
///
/// Each `ContextLocal` value is its own key: two instances never alias, even
/// when created with the same `T`. Values stored through the slot live on the
/// context, not the task, so a later task pinned to the same context observes
/// what an earlier one stored (until something clears it).
///
/// Every accessor fails with [`NoActiveContext`] when the calling thread is
/// not inside a context-aware task; tasks scheduled with
/// [`ContextExecutor::execute_direct`](crate::ContextExecutor::execute_direct)
/// have no access to context locals.
pub struct ContextLocal<T> {
    tag: u64,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> ContextLocal<T> {
    /// A new slot, distinct from every other slot.
    pub fn new() -> Self {
        Self {
            tag: next_tag(),
            _marker: PhantomData,
        }
    }

    /// Store `value` on the current context, replacing any previous value.
    pub fn set(&self, value: T) -> Result<(), NoActiveContext> {
        self.with_map(|map| {
            map.insert(self.tag, Box::new(value));
        })
    }

    /// Remove this slot's value from the current context.
    pub fn clear(&self) -> Result<(), NoActiveContext> {
        self.with_map(|map| {
            map.remove(&self.tag);
        })
    }

    /// Run `f` with a reference to this slot's value on the current context,
    /// or with `None` if the slot is unset.
    pub fn with<F, R>(&self, f: F) -> Result<R, NoActiveContext>
    where
        F: FnOnce(Option<&T>) -> R,
    {
        with_active_holder(|holder| {
            let holder = holder.ok_or(NoActiveContext)?;
            let map = holder.locals().lock().unwrap();
            Ok(f(map.get(&self.tag).and_then(|v| v.downcast_ref::<T>())))
        })
    }

    fn with_map<F, R>(&self, f: F) -> Result<R, NoActiveContext>
    where
        F: FnOnce(&mut HashMap<u64, Box<dyn Any + Send>>) -> R,
    {
        with_active_holder(|holder| {
            let holder = holder.ok_or(NoActiveContext)?;
            let mut map = holder.locals().lock().unwrap();
            Ok(f(&mut map))
        })
    }
}

impl<T: Clone + Send + 'static> ContextLocal<T> {
    /// A clone of this slot's value on the current context, or `None` if the
    /// slot is unset.
    pub fn get(&self) -> Result<Option<T>, NoActiveContext> {
        self.with(|v| v.cloned())
    }
}

impl<T: Send + 'static> Default for ContextLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fail_off_dispatch_threads() {
        let local: ContextLocal<u32> = ContextLocal::new();
        assert_eq!(local.set(5), Err(NoActiveContext));
        assert_eq!(local.get(), Err(NoActiveContext));
        assert_eq!(local.clear(), Err(NoActiveContext));
    }

    #[test]
    fn set_then_clear_round_trip() {
        let (executor, _factory) = crate::testing::test_executor(1, 1);
        let local = std::sync::Arc::new(ContextLocal::<String>::new());

        let local_clone = std::sync::Arc::clone(&local);
        let observed = executor
            .submit(move || {
                local_clone.set("value".to_string()).unwrap();
                let after_set = local_clone.get().unwrap();
                local_clone.clear().unwrap();
                let after_clear = local_clone.get().unwrap();
                (after_set, after_clear)
            })
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(observed, (Some("value".to_string()), None));
        executor.shutdown();
    }

    #[test]
    fn distinct_locals_do_not_alias() {
        let (executor, _factory) = crate::testing::test_executor(1, 1);
        let a = std::sync::Arc::new(ContextLocal::<u32>::new());
        let b = std::sync::Arc::new(ContextLocal::<u32>::new());

        let (a2, b2) = (std::sync::Arc::clone(&a), std::sync::Arc::clone(&b));
        let observed = executor
            .submit(move || {
                a2.set(1).unwrap();
                b2.set(2).unwrap();
                (a2.get().unwrap(), b2.get().unwrap())
            })
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(observed, (Some(1), Some(2)));
        executor.shutdown();
    }
}
