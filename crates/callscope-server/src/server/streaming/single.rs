//! Listener for calls whose client sends exactly one message.
//!
//! Unary and server-streaming handlers do their work at half-close, after
//! the one request has been received. [`SingleRequestListener`] buffers that
//! request and hands it to a completion callback exactly once.

use callscope_core::observer::CallObserver;
use tonic::Status;

/// Buffers the single request of a call until half-close.
///
/// On `on_completed` the callback receives:
///
/// - `Ok(request)` if exactly one message arrived,
/// - `Err(INTERNAL)` if none or more than one arrived.
///
/// On `on_error` the callback is dropped without being invoked.
pub struct SingleRequestListener<T, F> {
    request: Option<T>,
    extra: usize,
    on_request: Option<F>,
}

impl<T, F> SingleRequestListener<T, F>
where
    F: FnOnce(Result<T, Status>),
{
    pub fn new(on_request: F) -> Self {
        Self {
            request: None,
            extra: 0,
            on_request: Some(on_request),
        }
    }
}

impl<T, F> CallObserver<T> for SingleRequestListener<T, F>
where
    F: FnOnce(Result<T, Status>),
{
    fn on_next(&mut self, message: T) {
        if self.request.is_none() {
            self.request = Some(message);
        } else {
            self.extra += 1;
            tracing::warn!(extra = self.extra, "unexpected message on single-request call");
        }
    }

    fn on_error(&mut self, status: Status) {
        tracing::debug!(code = ?status.code(), "single-request call aborted");
        self.on_request = None;
    }

    fn on_completed(&mut self) {
        let Some(on_request) = self.on_request.take() else {
            tracing::warn!("on_completed after termination dropped");
            return;
        };
        let request = match (self.request.take(), self.extra) {
            (Some(request), 0) => Ok(request),
            (Some(_), _) => Err(Status::internal("Too many requests")),
            (None, _) => Err(Status::internal("Half-closed without a request")),
        };
        on_request(request);
    }

    fn is_closed(&self) -> bool {
        self.on_request.is_none()
    }
}
