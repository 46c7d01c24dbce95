//! gRPC adapter for the four interaction shapes.
//!
//! [`CallScopeService`] implements the generated [`CallScope`] trait. For
//! each call it:
//!
//! - takes the [`CallContext`] the interceptor stored in the request
//!   extensions, failing closed with `INTERNAL` when it is missing,
//! - registers the call with the [`CallTracker`],
//! - builds the shape's inbound listener, wrapped with a [`ContextHook`] so
//!   that half-close runs with the call's context and log correlation,
//! - pumps the inbound messages into it with [`drive`] and turns the
//!   outbound observer's channel into the gRPC response.

use crate::server::{
    config::ServerConfig,
    interceptor::{ContextHook, layer::call_span, wrap},
    lifecycle::{CallPermit, CallTracker},
    service::shapes::{FixedSequence, ResponseFactory, StreamingHandler},
    streaming::{
        driver::{DriveOutcome, drive},
        single::SingleRequestListener,
    },
    telemetry::{increment_responses_sent, increment_stream_errors},
};
use callscope_core::{
    Error,
    context::{CallContext, WithCallContextExt},
    observer::{CallObserver, ResponseObserver},
    proto::{self, call_scope_server::CallScope},
    types::StreamShape,
};
use core::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures::{Stream, TryStreamExt, stream};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

type ResponseStream = Pin<Box<dyn Stream<Item = Result<proto::Response, Status>> + Send>>;

/// gRPC service exposing the four interaction shapes.
#[derive(Clone)]
pub struct CallScopeService {
    handler: StreamingHandler,
    tracker: Arc<CallTracker>,
}

impl CallScopeService {
    /// Creates a service answering with [`FixedSequence`].
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_factory(config, FixedSequence)
    }

    pub fn with_factory(config: &ServerConfig, factory: impl ResponseFactory) -> Self {
        Self {
            handler: StreamingHandler::new(factory, config.server_stream_burst, config.bidi_burst),
            tracker: Arc::new(CallTracker::new()),
        }
    }

    /// Refuses new calls, drains in-flight calls for up to `drain_timeout`,
    /// then cancels the rest.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.tracker.shutdown(drain_timeout).await;
    }

    pub fn inflight(&self) -> usize {
        self.tracker.inflight()
    }
}

/// Takes the call context stored by the interceptor.
fn call_context<T>(request: &Request<T>, method: &'static str) -> Result<CallContext, Status> {
    request
        .extensions()
        .get::<CallContext>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!(method, "call reached handler without a call context");
            Error::ContextMissing { method }.into()
        })
}

/// Resolves a single-response call from what its observer emitted.
///
/// An empty channel means the call never produced a terminal event, which
/// happens when the inbound stream was aborted or the service shut down.
fn single_response(
    mut rx: UnboundedReceiver<Result<proto::Response, Status>>,
    outcome: DriveOutcome,
) -> Result<Response<proto::Response>, Status> {
    match rx.try_recv() {
        Ok(Ok(response)) => {
            increment_responses_sent(1);
            Ok(Response::new(response))
        }
        Ok(Err(status)) => {
            increment_stream_errors();
            Err(status)
        }
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
            increment_stream_errors();
            Err(match outcome {
                DriveOutcome::Aborted(status) => status,
                DriveOutcome::Shutdown => Error::ServiceShutdown.into(),
                DriveOutcome::HalfClosed | DriveOutcome::Stopped => {
                    Error::internal_msg("Call ended without a response").into()
                }
            })
        }
    }
}

/// Adapts an observer channel into a gRPC response stream.
fn response_stream(rx: UnboundedReceiver<Result<proto::Response, Status>>) -> ResponseStream {
    let stream = UnboundedReceiverStream::new(rx)
        .inspect_ok(|_| increment_responses_sent(1))
        .inspect_err(|_| increment_stream_errors());
    Box::pin(stream)
}

/// Response stream that keeps its call accounted as in flight until the
/// transport drops it.
struct Accounted {
    inner: ResponseStream,
    _permit: CallPermit,
}

impl Stream for Accounted {
    type Item = Result<proto::Response, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[tonic::async_trait]
impl CallScope for CallScopeService {
    type ServerStreamStream = ResponseStream;
    type BiStreamStream = ResponseStream;

    async fn get_one(
        &self,
        request: Request<proto::Request>,
    ) -> Result<Response<proto::Response>, Status> {
        let ctx = call_context(&request, "GetOne")?;
        let _permit = self.tracker.begin(StreamShape::Unary)?;

        let (mut responses, rx) = ResponseObserver::channel();
        let handler = &self.handler;
        let mut listener = wrap(
            SingleRequestListener::new(|request: Result<proto::Request, Status>| match request {
                Ok(request) => handler.get_one(request, &mut responses),
                Err(status) => responses.on_error(status),
            }),
            ContextHook::new(ctx),
        );
        let inbound = stream::iter([Ok(request.into_inner())]);
        let outcome = drive(inbound, &mut listener, self.tracker.shutdown_token()).await;
        drop(listener);

        single_response(rx, outcome)
    }

    async fn client_stream(
        &self,
        request: Request<Streaming<proto::Request>>,
    ) -> Result<Response<proto::Response>, Status> {
        let ctx = call_context(&request, "ClientStream")?;
        let _permit = self.tracker.begin(StreamShape::ClientStreaming)?;

        let (responses, rx) = ResponseObserver::channel();
        let mut listener = wrap(self.handler.client_stream(responses), ContextHook::new(ctx));
        let outcome = drive(
            request.into_inner(),
            &mut listener,
            self.tracker.shutdown_token(),
        )
        .await;
        drop(listener);

        single_response(rx, outcome)
    }

    async fn server_stream(
        &self,
        request: Request<proto::Request>,
    ) -> Result<Response<Self::ServerStreamStream>, Status> {
        let ctx = call_context(&request, "ServerStream")?;
        let permit = self.tracker.begin(StreamShape::ServerStreaming)?;

        let (mut responses, rx) = ResponseObserver::channel();
        let handler = &self.handler;
        let mut listener = wrap(
            SingleRequestListener::new(|request: Result<proto::Request, Status>| match request {
                Ok(request) => handler.server_stream(request, &mut responses),
                Err(status) => responses.on_error(status),
            }),
            ContextHook::new(ctx),
        );
        let inbound = stream::iter([Ok(request.into_inner())]);
        let outcome = drive(inbound, &mut listener, self.tracker.shutdown_token()).await;
        drop(listener);

        if let DriveOutcome::Shutdown = outcome {
            increment_stream_errors();
            return Err(Error::ServiceShutdown.into());
        }
        Ok(Response::new(Box::pin(Accounted {
            inner: response_stream(rx),
            _permit: permit,
        })))
    }

    async fn bi_stream(
        &self,
        request: Request<Streaming<proto::Request>>,
    ) -> Result<Response<Self::BiStreamStream>, Status> {
        let ctx = call_context(&request, "BiStream")?;
        let permit = self.tracker.begin(StreamShape::Bidirectional)?;

        let (responses, rx) = ResponseObserver::channel();
        let mut listener = wrap(
            self.handler.bi_stream(responses),
            ContextHook::new(ctx.clone()),
        );
        let inbound = request.into_inner();
        let tracker = Arc::clone(&self.tracker);
        let span = call_span(&ctx);

        let fut = async move {
            let outcome = drive(inbound, &mut listener, tracker.shutdown_token()).await;
            // The observer emits nothing after an inbound failure, so the
            // response stream is ended with it here.
            let failure: Option<Status> = match outcome {
                DriveOutcome::Aborted(status) => Some(status),
                DriveOutcome::Shutdown => Some(Error::ServiceShutdown.into()),
                DriveOutcome::HalfClosed | DriveOutcome::Stopped => None,
            };
            if let Some(status) = failure {
                listener.into_inner().into_responses().on_error(status);
            }
            drop(permit);
        };
        tokio::spawn(fut.with_call_context(ctx).instrument(span));

        Ok(Response::new(response_stream(rx)))
    }
}
