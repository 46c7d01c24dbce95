use callscope_core::{Error, observer::CallObserver};
use futures::{Stream, StreamExt};
use std::pin::pin;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// How [`drive`] stopped delivering events.
#[derive(Debug)]
pub enum DriveOutcome {
    /// The inbound stream ended and the listener received `on_completed`.
    HalfClosed,
    /// The listener closed itself before the inbound stream ended.
    Stopped,
    /// The inbound stream failed. The listener received `on_error` with the
    /// same status.
    Aborted(Status),
    /// The service is shutting down. The listener received `on_error` with
    /// `UNAVAILABLE`.
    Shutdown,
}

/// Pumps `inbound` into `listener` until one side is done.
///
/// Events are delivered strictly in order: any number of `on_next` followed
/// by at most one of `on_error` or `on_completed`.
///
/// # Arguments
///
/// - `inbound`: Messages sent by the client. A `None` is the half-close.
/// - `listener`: Receives the events, usually a listener returned by
///   [`wrap`](crate::server::interceptor::wrap).
/// - `shutdown`: Cancelled when the service gives up on in-flight calls.
///
/// # Behavior
///
/// - Shutdown is checked before every message, so a cancelled token wins
///   over a message that is already buffered.
/// - A listener reporting [`is_closed`](CallObserver::is_closed) after a
///   message stops the pump without a terminal event. It has already
///   terminated the call on its own.
pub async fn drive<T, S, L>(
    inbound: S,
    listener: &mut L,
    shutdown: &CancellationToken,
) -> DriveOutcome
where
    S: Stream<Item = Result<T, Status>>,
    L: CallObserver<T>,
{
    let mut inbound = pin!(inbound);

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                tracing::debug!("shutdown interrupted inbound stream");
                listener.on_error(Error::ServiceShutdown.into());
                return DriveOutcome::Shutdown;
            }
            next = inbound.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                listener.on_next(message);
                if listener.is_closed() {
                    return DriveOutcome::Stopped;
                }
            }
            Some(Err(status)) => {
                tracing::debug!(code = ?status.code(), "inbound stream failed");
                listener.on_error(status.clone());
                return DriveOutcome::Aborted(status);
            }
            None => {
                listener.on_completed();
                return DriveOutcome::HalfClosed;
            }
        }
    }
}
