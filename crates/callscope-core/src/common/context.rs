//! # Per-call context
//!
//! A [`CallContext`] is an immutable, append-only mapping from typed
//! [`Key`]s to values. Attaching a value never mutates an existing context:
//! [`CallContext::with_value`] returns a new context whose head points at the
//! previous one, so derived contexts share their ancestors and can be cloned
//! and read from any thread without locking.
//!
//! Each thread also carries an *ambient* context, initially the empty root.
//! [`CallContext::attach`] makes a context the ambient one and returns a
//! [`ContextGuard`]; dropping the guard restores whatever was active before,
//! including while unwinding from a panic. A task may resume on another
//! worker thread after an `.await`, so async code either passes the context
//! explicitly or wraps the future with
//! [`WithCallContextExt::with_call_context`], which attaches it around every
//! poll.
//!
//! ## Well-known keys
//!
//! - [`TRANSACTION_ID`] - caller supplied or server minted transaction id
//! - [`METHOD_NAME`] - fully-qualified gRPC method (`package.Service/Method`)
//! - [`REQUEST_START_TIME`] - wall-clock start of the call in ms since the
//!   UNIX epoch

use core::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};
use pin_project_lite::pin_project;
use std::{cell::RefCell, sync::Arc};

/// Transaction id of the call.
pub const TRANSACTION_ID: Key<String> = Key::new("transaction-id");

/// Fully-qualified method name of the call.
pub const METHOD_NAME: Key<String> = Key::new("method-name");

/// Milliseconds since the UNIX epoch at which the call was intercepted.
pub const REQUEST_START_TIME: Key<i64> = Key::new("request-start-time");

thread_local! {
    static CURRENT: RefCell<CallContext> = const { RefCell::new(CallContext::root()) };
}

/// A value stored in a [`CallContext`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextValue {
    Str(Arc<str>),
    Int(i64),
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Str(s) => f.write_str(s),
            ContextValue::Int(i) => write!(f, "{i}"),
        }
    }
}

/// Conversion between a Rust type and its [`ContextValue`] representation.
///
/// Implemented for the value types used by the well-known keys.
pub trait ContextType: Sized {
    fn into_value(self) -> ContextValue;
    fn from_value(value: &ContextValue) -> Option<Self>;
}

impl ContextType for String {
    fn into_value(self) -> ContextValue {
        ContextValue::Str(Arc::from(self))
    }

    fn from_value(value: &ContextValue) -> Option<Self> {
        match value {
            ContextValue::Str(s) => Some(s.to_string()),
            ContextValue::Int(_) => None,
        }
    }
}

impl ContextType for i64 {
    fn into_value(self) -> ContextValue {
        ContextValue::Int(self)
    }

    fn from_value(value: &ContextValue) -> Option<Self> {
        match value {
            ContextValue::Int(i) => Some(*i),
            ContextValue::Str(_) => None,
        }
    }
}

/// A named, typed key into a [`CallContext`].
///
/// Keys compare by name. A lookup through a key whose type does not match the
/// stored value yields `None`.
pub struct Key<T> {
    name: &'static str,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _ty: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

struct Entry {
    key: &'static str,
    value: ContextValue,
    parent: Option<Arc<Entry>>,
}

/// Immutable per-call key/value context.
///
/// Cloning is a reference-count bump. See the [module docs](self) for the
/// attach/restore discipline.
#[derive(Clone, Default)]
pub struct CallContext {
    head: Option<Arc<Entry>>,
}

impl CallContext {
    /// The empty context every chain starts from.
    pub const fn root() -> Self {
        Self { head: None }
    }

    /// Returns a clone of the ambient context of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Returns a new context with `key` bound to `value`, shadowing any
    /// earlier binding of the same key. `self` is left untouched.
    #[must_use]
    pub fn with_value<T: ContextType>(&self, key: Key<T>, value: T) -> Self {
        Self {
            head: Some(Arc::new(Entry {
                key: key.name(),
                value: value.into_value(),
                parent: self.head.clone(),
            })),
        }
    }

    /// Looks up the most recent binding of `key`.
    pub fn get<T: ContextType>(&self, key: Key<T>) -> Option<T> {
        self.iter()
            .find(|(name, _)| *name == key.name())
            .and_then(|(_, value)| T::from_value(value))
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.get(TRANSACTION_ID)
    }

    pub fn method_name(&self) -> Option<String> {
        self.get(METHOD_NAME)
    }

    pub fn request_start_time(&self) -> Option<i64> {
        self.get(REQUEST_START_TIME)
    }

    /// Iterates bindings from newest to oldest. Shadowed bindings are
    /// included.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ContextValue)> {
        let mut next = self.head.as_deref();
        core::iter::from_fn(move || {
            let entry = next?;
            next = entry.parent.as_deref();
            Some((entry.key, &entry.value))
        })
    }

    /// Number of attachments in the chain.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_root(&self) -> bool {
        self.head.is_none()
    }

    /// Whether both handles refer to the same context value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Makes `self` the ambient context of the calling thread until the
    /// returned guard is dropped.
    #[must_use = "the previous context is restored when the guard is dropped"]
    pub fn attach(&self) -> ContextGuard {
        let previous = CURRENT.with(|current| current.replace(self.clone()));
        ContextGuard {
            previous: Some(previous),
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Restores the previously ambient context on drop.
///
/// Not `Send`: it must be dropped on the thread that created it.
pub struct ContextGuard {
    previous: Option<CallContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The thread-local may already be gone during thread teardown.
            let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("previous", &self.previous)
            .finish()
    }
}

pin_project! {
    /// Future returned by [`WithCallContextExt::with_call_context`].
    ///
    /// The context is ambient during every poll of the inner future and
    /// restored between polls, so the task may migrate between worker threads
    /// without leaking the context to whatever else those threads run.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct WithCallContext<F> {
        #[pin]
        inner: F,
        ctx: CallContext,
    }
}

impl<F: Future> Future for WithCallContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.project();
        let _guard = this.ctx.attach();
        this.inner.poll(cx)
    }
}

/// Attaches a [`CallContext`] to a future for the duration of each poll.
pub trait WithCallContextExt: Future + Sized {
    fn with_call_context(self, ctx: CallContext) -> WithCallContext<Self> {
        WithCallContext { inner: self, ctx }
    }
}

impl<F: Future> WithCallContextExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn call_context(txn: &str) -> CallContext {
        CallContext::root()
            .with_value(TRANSACTION_ID, txn.to_string())
            .with_value(METHOD_NAME, "callscope.v1.CallScope/GetOne".to_string())
            .with_value(REQUEST_START_TIME, 1_700_000_000_000)
    }

    #[test]
    fn with_value_does_not_mutate_parent() {
        let root = CallContext::root();
        let child = root.with_value(TRANSACTION_ID, "a".to_string());

        assert!(root.is_root());
        assert_eq!(root.transaction_id(), None);
        assert_eq!(child.transaction_id().as_deref(), Some("a"));
        assert_eq!(child.len(), 1);
    }

    #[test]
    fn later_binding_shadows_earlier() {
        let first = CallContext::root().with_value(TRANSACTION_ID, "a".to_string());
        let second = first.with_value(TRANSACTION_ID, "b".to_string());

        assert_eq!(first.transaction_id().as_deref(), Some("a"));
        assert_eq!(second.transaction_id().as_deref(), Some("b"));
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn typed_lookup() {
        let ctx = call_context("txn");
        assert_eq!(ctx.request_start_time(), Some(1_700_000_000_000));
        assert_eq!(
            ctx.method_name().as_deref(),
            Some("callscope.v1.CallScope/GetOne")
        );

        // Same name, wrong type.
        let mistyped: Key<i64> = Key::new("transaction-id");
        assert_eq!(ctx.get(mistyped), None);
    }

    #[test]
    fn iter_is_newest_first() {
        let ctx = call_context("txn");
        let names: Vec<_> = ctx.iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            ["request-start-time", "method-name", "transaction-id"]
        );
    }

    #[test]
    fn attach_and_restore() {
        assert!(CallContext::current().is_root());

        let outer = call_context("outer");
        let inner = call_context("inner");
        {
            let _outer = outer.attach();
            assert!(CallContext::current().ptr_eq(&outer));
            {
                let _inner = inner.attach();
                assert_eq!(
                    CallContext::current().transaction_id().as_deref(),
                    Some("inner")
                );
            }
            assert!(CallContext::current().ptr_eq(&outer));
        }
        assert!(CallContext::current().is_root());
    }

    #[test]
    fn restore_runs_on_panic() {
        let ctx = call_context("panicking");
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = ctx.attach();
            panic!("handler failure");
        }));

        assert!(result.is_err());
        assert!(CallContext::current().is_root());
    }

    #[test]
    fn ambient_context_is_per_thread() {
        let ctx = call_context("main");
        let _guard = ctx.attach();

        let seen = std::thread::spawn(|| CallContext::current().is_root())
            .join()
            .unwrap();
        assert!(seen);

        // An explicitly moved context is readable on any thread.
        let moved = ctx.clone();
        let txn = std::thread::spawn(move || moved.transaction_id())
            .join()
            .unwrap();
        assert_eq!(txn.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn future_sees_context_on_every_poll() {
        let ctx = call_context("async");
        let observed = async {
            let first = CallContext::current().transaction_id();
            tokio::task::yield_now().await;
            let second = CallContext::current().transaction_id();
            (first, second)
        }
        .with_call_context(ctx)
        .await;

        assert_eq!(observed.0.as_deref(), Some("async"));
        assert_eq!(observed.1.as_deref(), Some("async"));
        assert!(CallContext::current().is_root());
    }

    #[test]
    fn debug_lists_bindings() {
        let ctx = CallContext::root().with_value(TRANSACTION_ID, "abc".to_string());
        let rendered = format!("{ctx:?}");
        assert!(rendered.contains("transaction-id"));
        assert!(rendered.contains("abc"));
    }
}
