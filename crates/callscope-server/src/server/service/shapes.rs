//! Business logic of the four interaction shapes.
//!
//! [`StreamingHandler`] is transport-agnostic: it consumes requests and emits
//! responses through [`CallObserver`]s, so the same logic is exercised by the
//! gRPC adapter in [`handler`](super::handler) and by plain unit tests.
//!
//! | Shape            | Emits                                   | Completes               |
//! |------------------|-----------------------------------------|-------------------------|
//! | unary            | one response                            | right after it          |
//! | client-streaming | one response, after the client is done  | after the response      |
//! | server-streaming | `server_stream_burst` responses         | after the last one      |
//! | bidirectional    | `bidi_burst` responses per message      | when the client is done |

use callscope_core::{
    Error,
    log_context::LogContext,
    observer::{CallObserver, StreamEvent, StreamState},
    proto::{Request, Response},
    types::{
        DEFAULT_BIDI_BURST, DEFAULT_PAYLOAD, DEFAULT_SERVER_STREAM_BURST, LOG_TRANSACTION_KEY,
        StreamShape,
    },
};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tonic::Status;

/// Produces the response messages of a call.
///
/// `request` is the message being answered, or `None` when the response
/// answers a whole client stream.
pub trait ResponseFactory: Send + Sync + 'static {
    fn respond(
        &self,
        shape: StreamShape,
        request: Option<&Request>,
    ) -> callscope_core::Result<Response>;
}

/// Answers every request with [`DEFAULT_PAYLOAD`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSequence;

impl ResponseFactory for FixedSequence {
    fn respond(
        &self,
        _shape: StreamShape,
        _request: Option<&Request>,
    ) -> callscope_core::Result<Response> {
        Ok(Response {
            value: DEFAULT_PAYLOAD.to_vec(),
        })
    }
}

/// Rejects requests the endpoint does not serve.
pub fn validate_request(request: &Request) -> callscope_core::Result<()> {
    if request.custom_object.is_some() {
        return Err(Error::InvalidRequest {
            reason: "custom_object is not supported".to_string(),
        });
    }
    Ok(())
}

/// Diagnostic event emitted for every event a handler sees.
fn diag(shape: StreamShape, event: &'static str) {
    tracing::info!(
        shape = shape.as_str(),
        event,
        transaction = %LogContext::get(LOG_TRANSACTION_KEY).unwrap_or_default(),
        "call event"
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Shared business logic of the four shapes.
#[derive(Clone)]
pub struct StreamingHandler {
    factory: Arc<dyn ResponseFactory>,
    server_stream_burst: usize,
    bidi_burst: usize,
}

impl Default for StreamingHandler {
    fn default() -> Self {
        Self::new(FixedSequence, DEFAULT_SERVER_STREAM_BURST, DEFAULT_BIDI_BURST)
    }
}

impl StreamingHandler {
    pub fn new(
        factory: impl ResponseFactory,
        server_stream_burst: usize,
        bidi_burst: usize,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            server_stream_burst,
            bidi_burst,
        }
    }

    /// Validates `request` (if any) and builds one response. Panics in the
    /// factory are contained and reported as an internal error.
    fn respond(
        &self,
        shape: StreamShape,
        request: Option<&Request>,
    ) -> callscope_core::Result<Response> {
        if let Some(request) = request {
            validate_request(request)?;
        }
        match catch_unwind(AssertUnwindSafe(|| self.factory.respond(shape, request))) {
            Ok(result) => result,
            Err(payload) => {
                tracing::error!(
                    shape = shape.as_str(),
                    panic = panic_message(payload.as_ref()),
                    "response construction panicked"
                );
                Err(Error::internal_msg("Failed to process request"))
            }
        }
    }

    /// Emits `error` as the terminal event of a call, logging its cause.
    fn fail<O: CallObserver<Response>>(shape: StreamShape, error: Error, responses: &mut O) {
        match &error {
            Error::InvalidRequest { reason } => {
                tracing::debug!(
                    shape = shape.as_str(),
                    reason = reason.as_str(),
                    "request rejected"
                );
            }
            other => {
                let cause = std::error::Error::source(other).map(ToString::to_string);
                tracing::warn!(
                    shape = shape.as_str(),
                    error = %other,
                    cause = cause.as_deref(),
                    "call failed"
                );
            }
        }
        diag(shape, "on_error");
        responses.on_error(error.into());
    }

    /// Unary: one response, then completion.
    pub fn get_one<O: CallObserver<Response>>(&self, request: Request, responses: &mut O) {
        let shape = StreamShape::Unary;
        diag(shape, "on_next");
        match self.respond(shape, Some(&request)) {
            Ok(response) => {
                responses.on_next(response);
                responses.on_completed();
                diag(shape, "on_completed");
            }
            Err(error) => Self::fail(shape, error, responses),
        }
    }

    /// Server-streaming: `server_stream_burst` responses, then completion.
    pub fn server_stream<O: CallObserver<Response>>(&self, request: Request, responses: &mut O) {
        let shape = StreamShape::ServerStreaming;
        diag(shape, "on_next");
        for _ in 0..self.server_stream_burst {
            if responses.is_closed() {
                tracing::debug!(shape = shape.as_str(), "receiver gone, burst abandoned");
                return;
            }
            match self.respond(shape, Some(&request)) {
                Ok(response) => responses.on_next(response),
                Err(error) => return Self::fail(shape, error, responses),
            }
        }
        responses.on_completed();
        diag(shape, "on_completed");
    }

    /// Client-streaming: accumulates messages and answers once the client
    /// finishes.
    pub fn client_stream<O: CallObserver<Response>>(
        &self,
        responses: O,
    ) -> ClientStreamObserver<O> {
        ClientStreamObserver {
            handler: self.clone(),
            responses,
            state: StreamState::default(),
            received: 0,
        }
    }

    /// Bidirectional: answers each message with a `bidi_burst` burst and
    /// completes when the client finishes.
    pub fn bi_stream<O: CallObserver<Response>>(&self, responses: O) -> BiStreamObserver<O> {
        BiStreamObserver {
            handler: self.clone(),
            responses,
            state: StreamState::default(),
        }
    }
}

/// Drops an event the state machine rejects.
fn rejected(shape: StreamShape, state: StreamState, event: StreamEvent) {
    tracing::warn!(shape = shape.as_str(), ?state, ?event, "event ignored");
}

/// Inbound observer of a client-streaming call.
pub struct ClientStreamObserver<O> {
    handler: StreamingHandler,
    responses: O,
    state: StreamState,
    received: usize,
}

impl<O> ClientStreamObserver<O> {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn into_responses(self) -> O {
        self.responses
    }
}

impl<O: CallObserver<Response>> CallObserver<Request> for ClientStreamObserver<O> {
    fn on_next(&mut self, message: Request) {
        let shape = StreamShape::ClientStreaming;
        if !self.state.advance(StreamEvent::Next) {
            return rejected(shape, self.state, StreamEvent::Next);
        }
        diag(shape, "on_next");
        if let Err(error) = validate_request(&message) {
            self.state.advance(StreamEvent::Error);
            return StreamingHandler::fail(shape, error, &mut self.responses);
        }
        self.received += 1;
    }

    fn on_error(&mut self, status: Status) {
        let shape = StreamShape::ClientStreaming;
        if !self.state.advance(StreamEvent::Error) {
            return rejected(shape, self.state, StreamEvent::Error);
        }
        diag(shape, "on_error");
        tracing::warn!(
            shape = shape.as_str(),
            error = %Error::StreamAborted { status },
            received = self.received,
            "client stream aborted"
        );
    }

    fn on_completed(&mut self) {
        let shape = StreamShape::ClientStreaming;
        if !self.state.advance(StreamEvent::Completed) {
            return rejected(shape, self.state, StreamEvent::Completed);
        }
        diag(shape, "on_completed");
        match self.handler.respond(shape, None) {
            Ok(response) => {
                self.responses.on_next(response);
                self.responses.on_completed();
                self.state.advance(StreamEvent::Finished);
            }
            Err(error) => {
                self.state.advance(StreamEvent::Error);
                StreamingHandler::fail(shape, error, &mut self.responses);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed() || self.responses.is_closed()
    }
}

/// Inbound observer of a bidirectional call.
pub struct BiStreamObserver<O> {
    handler: StreamingHandler,
    responses: O,
    state: StreamState,
}

impl<O> BiStreamObserver<O> {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn into_responses(self) -> O {
        self.responses
    }
}

impl<O: CallObserver<Response>> CallObserver<Request> for BiStreamObserver<O> {
    fn on_next(&mut self, message: Request) {
        let shape = StreamShape::Bidirectional;
        if !self.state.advance(StreamEvent::Next) {
            return rejected(shape, self.state, StreamEvent::Next);
        }
        diag(shape, "on_next");
        for _ in 0..self.handler.bidi_burst {
            match self.handler.respond(shape, Some(&message)) {
                Ok(response) => self.responses.on_next(response),
                Err(error) => {
                    self.state.advance(StreamEvent::Error);
                    return StreamingHandler::fail(shape, error, &mut self.responses);
                }
            }
        }
    }

    fn on_error(&mut self, status: Status) {
        let shape = StreamShape::Bidirectional;
        if !self.state.advance(StreamEvent::Error) {
            return rejected(shape, self.state, StreamEvent::Error);
        }
        diag(shape, "on_error");
        tracing::warn!(
            shape = shape.as_str(),
            error = %Error::StreamAborted { status },
            "bidirectional stream aborted"
        );
    }

    fn on_completed(&mut self) {
        let shape = StreamShape::Bidirectional;
        if !self.state.advance(StreamEvent::Completed) {
            return rejected(shape, self.state, StreamEvent::Completed);
        }
        diag(shape, "on_completed");
        self.responses.on_completed();
        self.state.advance(StreamEvent::Finished);
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed() || self.responses.is_closed()
    }
}
