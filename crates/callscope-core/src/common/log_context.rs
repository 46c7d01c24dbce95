//! Thread-local key/value store consumed by log call sites.
//!
//! The store is populated from a [`CallContext`](crate::context::CallContext)
//! right before a handler processes a client's final message and is restored
//! afterwards, so a value never outlives the call that published it on a
//! given thread.

use std::{cell::RefCell, collections::BTreeMap};

thread_local! {
    static LOG_CONTEXT: RefCell<BTreeMap<&'static str, String>> =
        const { RefCell::new(BTreeMap::new()) };
}

/// Accessors for the calling thread's logging context.
pub struct LogContext;

impl LogContext {
    /// Stores `value` under `key`, returning the value it replaced.
    pub fn put(key: &'static str, value: impl Into<String>) -> Option<String> {
        LOG_CONTEXT.with(|ctx| ctx.borrow_mut().insert(key, value.into()))
    }

    pub fn get(key: &str) -> Option<String> {
        LOG_CONTEXT.with(|ctx| ctx.borrow().get(key).cloned())
    }

    /// Stores `value` under `key` until the returned guard is dropped, then
    /// puts back whatever was there before (or removes the key).
    #[must_use = "the previous value is restored when the guard is dropped"]
    pub fn scoped(key: &'static str, value: impl Into<String>) -> LogContextGuard {
        let previous = Self::put(key, value);
        LogContextGuard {
            key,
            previous,
            _not_send: core::marker::PhantomData,
        }
    }
}

/// Restores a [`LogContext`] entry on drop.
#[derive(Debug)]
pub struct LogContextGuard {
    key: &'static str,
    previous: Option<String>,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl Drop for LogContextGuard {
    fn drop(&mut self) {
        let key = self.key;
        let previous = self.previous.take();
        let _ = LOG_CONTEXT.try_with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            match previous {
                Some(value) => {
                    ctx.insert(key, value);
                }
                None => {
                    ctx.remove(key);
                }
            }
        });
    }
}
