//! # Call observers
//!
//! Every gRPC call is modelled as two push-style channels of events:
//! `on_next(message)*` followed by at most one of `on_error(status)` or
//! `on_completed()`. [`CallObserver`] is that contract. Handlers implement it
//! for the inbound direction, and [`ResponseObserver`] implements it for the
//! outbound direction on top of a tokio channel feeding the gRPC response
//! stream.
//!
//! [`StreamState`] is the per-call state machine used by handlers of
//! streaming requests:
//!
//! ```text
//!   OPEN --on_completed--> COMPLETING --finished--> CLOSED
//!     |                        |
//!     +-------on_error---------+-----------------> CLOSED
//! ```

use tokio::sync::mpsc;
use tonic::Status;

/// Receives the events of one direction of a call.
///
/// Implementations may assume the driver never delivers `on_next` after a
/// terminal event and never delivers two terminal events, but must tolerate
/// (and drop) such events rather than panic.
pub trait CallObserver<T> {
    fn on_next(&mut self, message: T);

    fn on_error(&mut self, status: Status);

    /// The sender has finished. For the inbound direction this is the
    /// client's half-close.
    fn on_completed(&mut self);

    /// Whether the observer accepts further events. Drivers stop delivering
    /// once this returns `true`.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Lifecycle of a streaming call as seen by its handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Open,
    Completing,
    Closed,
}

/// Inputs driving [`StreamState`] transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Next,
    Error,
    Completed,
    /// Finalization after `Completed` is done.
    Finished,
}

impl StreamState {
    /// Returns the state after `event`, or `None` if the event is not
    /// accepted in the current state.
    pub const fn on(self, event: StreamEvent) -> Option<StreamState> {
        match (self, event) {
            (StreamState::Open, StreamEvent::Next) => Some(StreamState::Open),
            (StreamState::Open, StreamEvent::Completed) => Some(StreamState::Completing),
            (StreamState::Completing, StreamEvent::Finished) => Some(StreamState::Closed),
            (StreamState::Open | StreamState::Completing, StreamEvent::Error) => {
                Some(StreamState::Closed)
            }
            _ => None,
        }
    }

    /// Applies `event` in place. Returns `false` and leaves the state
    /// unchanged if the event is rejected.
    pub fn advance(&mut self, event: StreamEvent) -> bool {
        match self.on(event) {
            Some(next) => {
                *self = next;
                true
            }
            None => false,
        }
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Outbound observer that forwards responses into a gRPC response stream.
///
/// `on_completed` and `on_error` terminate the observer by dropping the
/// sender, which ends the response stream. Events delivered afterwards are
/// dropped and logged. If the receiving side is gone (the client cancelled
/// or the transport dropped the stream) the observer terminates itself on
/// the next send.
#[derive(Debug)]
pub struct ResponseObserver<T> {
    tx: Option<mpsc::UnboundedSender<Result<T, Status>>>,
    sent: usize,
}

impl<T> ResponseObserver<T> {
    pub fn new(tx: mpsc::UnboundedSender<Result<T, Status>>) -> Self {
        Self { tx: Some(tx), sent: 0 }
    }

    /// Creates an observer along with the receiving end of its stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Result<T, Status>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Whether a terminal event has been emitted (or the receiver is gone and
    /// a send already failed).
    pub fn is_terminated(&self) -> bool {
        self.tx.is_none()
    }

    /// Whether the receiving side has gone away.
    pub fn is_cancelled(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Number of messages successfully handed to the response stream.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl<T> CallObserver<T> for ResponseObserver<T> {
    fn on_next(&mut self, message: T) {
        let Some(tx) = &self.tx else {
            tracing::warn!("on_next after termination dropped");
            return;
        };
        if tx.send(Ok(message)).is_err() {
            tracing::debug!("response receiver dropped, terminating observer");
            self.tx = None;
        } else {
            self.sent += 1;
        }
    }

    fn on_error(&mut self, status: Status) {
        match self.tx.take() {
            Some(tx) => {
                if let Err(_e) = tx.send(Err(status)) {
                    tracing::debug!("response receiver dropped before error delivery");
                }
            }
            None => tracing::warn!(code = ?status.code(), "on_error after termination dropped"),
        }
    }

    fn on_completed(&mut self) {
        if self.tx.take().is_none() {
            tracing::warn!("on_completed after termination dropped");
        }
    }

    fn is_closed(&self) -> bool {
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[test]
    fn state_machine_happy_path() {
        let mut state = StreamState::default();
        assert!(state.advance(StreamEvent::Next));
        assert!(state.advance(StreamEvent::Next));
        assert_eq!(state, StreamState::Open);
        assert!(state.advance(StreamEvent::Completed));
        assert_eq!(state, StreamState::Completing);
        assert!(state.advance(StreamEvent::Finished));
        assert!(state.is_closed());
    }

    #[test]
    fn state_machine_rejects_events_after_close() {
        let mut state = StreamState::Closed;
        for event in [
            StreamEvent::Next,
            StreamEvent::Error,
            StreamEvent::Completed,
            StreamEvent::Finished,
        ] {
            assert!(!state.advance(event));
            assert_eq!(state, StreamState::Closed);
        }
    }

    #[test]
    fn state_machine_error_closes_from_open_and_completing() {
        assert_eq!(
            StreamState::Open.on(StreamEvent::Error),
            Some(StreamState::Closed)
        );
        assert_eq!(
            StreamState::Completing.on(StreamEvent::Error),
            Some(StreamState::Closed)
        );
        // Completion is entered exactly once.
        assert_eq!(StreamState::Completing.on(StreamEvent::Completed), None);
        assert_eq!(StreamState::Completing.on(StreamEvent::Next), None);
    }

    #[test]
    fn completed_ends_the_stream() {
        let (mut observer, mut rx) = ResponseObserver::<u32>::channel();
        observer.on_next(1);
        observer.on_next(2);
        observer.on_completed();

        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert_eq!(observer.sent(), 2);
        assert!(observer.is_terminated());
    }

    #[test]
    fn events_after_termination_are_dropped() {
        let (mut observer, mut rx) = ResponseObserver::<u32>::channel();
        observer.on_error(Status::internal("boom"));
        observer.on_next(1);
        observer.on_completed();
        observer.on_error(Status::internal("again"));

        let status = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert_eq!(status.message(), "boom");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert_eq!(observer.sent(), 0);
    }

    #[test]
    fn dropped_receiver_terminates_observer() {
        let (mut observer, rx) = ResponseObserver::<u32>::channel();
        assert!(!observer.is_cancelled());
        drop(rx);
        assert!(observer.is_cancelled());
        assert!(CallObserver::is_closed(&observer));

        observer.on_next(1);
        assert!(observer.is_terminated());
        assert_eq!(observer.sent(), 0);
    }
}
