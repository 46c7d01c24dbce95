//! Half-close decoration of inbound call listeners.
//!
//! [`wrap`] returns a listener that forwards every event to the wrapped one
//! unchanged, except `on_completed`: before forwarding it, a
//! [`HalfCloseHook`] is entered, and the guard it returns is dropped once the
//! forward returns or unwinds. The hook used by the server is
//! [`ContextHook`], which makes the call's [`CallContext`] ambient and
//! publishes its transaction id into the [`LogContext`] so that everything
//! the handler logs while finishing the call is correlated.

use crate::server::telemetry::{increment_context_attached, increment_context_restored};
use callscope_core::{
    context::{CallContext, ContextGuard},
    log_context::{LogContext, LogContextGuard},
    observer::CallObserver,
    types::LOG_TRANSACTION_KEY,
};
use tonic::Status;

/// Scoped action entered around the forwarded half-close.
pub trait HalfCloseHook {
    /// Dropped after the wrapped listener's `on_completed` returns, including
    /// while unwinding.
    type Guard;

    fn enter(&mut self) -> Self::Guard;
}

/// Decorates `listener` so that `hook` is entered around its half-close.
pub fn wrap<L, H>(listener: L, hook: H) -> HookedListener<L, H> {
    HookedListener { listener, hook }
}

/// Listener returned by [`wrap`].
#[derive(Debug)]
pub struct HookedListener<L, H> {
    listener: L,
    hook: H,
}

impl<L, H> HookedListener<L, H> {
    pub fn get_ref(&self) -> &L {
        &self.listener
    }

    pub fn into_inner(self) -> L {
        self.listener
    }
}

impl<T, L, H> CallObserver<T> for HookedListener<L, H>
where
    L: CallObserver<T>,
    H: HalfCloseHook,
{
    fn on_next(&mut self, message: T) {
        self.listener.on_next(message);
    }

    fn on_error(&mut self, status: Status) {
        self.listener.on_error(status);
    }

    fn on_completed(&mut self) {
        let _scope = self.hook.enter();
        self.listener.on_completed();
    }

    fn is_closed(&self) -> bool {
        self.listener.is_closed()
    }
}

/// Attaches a call's context and log correlation around its half-close.
#[derive(Debug, Clone)]
pub struct ContextHook {
    ctx: CallContext,
}

impl ContextHook {
    pub fn new(ctx: CallContext) -> Self {
        Self { ctx }
    }
}

impl HalfCloseHook for ContextHook {
    type Guard = ContextScope;

    fn enter(&mut self) -> ContextScope {
        let attached = self.ctx.attach();
        increment_context_attached();

        // Read back through the ambient context, not the captured one.
        let transaction_id = CallContext::current().transaction_id().unwrap_or_default();
        let logged = LogContext::scoped(LOG_TRANSACTION_KEY, transaction_id);

        ContextScope {
            logged: Some(logged),
            attached: Some(attached),
        }
    }
}

/// Guard returned by [`ContextHook::enter`].
///
/// Drops the log correlation first, then restores the previously ambient
/// context.
#[must_use = "the context is restored when the scope is dropped"]
pub struct ContextScope {
    logged: Option<LogContextGuard>,
    attached: Option<ContextGuard>,
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        drop(self.logged.take());
        if self.attached.take().is_some() {
            increment_context_restored();
        }
    }
}
