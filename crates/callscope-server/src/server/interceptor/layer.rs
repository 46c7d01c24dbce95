//! Tower layer establishing the [`CallContext`] of every inbound call.
//!
//! For each request the layer:
//!
//! 1. starts from the ambient context (empty on transport threads),
//! 2. binds the transaction id derived from the `app-transaction` header,
//! 3. binds the fully-qualified method name taken from the HTTP/2 path,
//! 4. binds the wall-clock start time in milliseconds,
//! 5. stores the result in the request extensions for the handler and keeps
//!    it ambient, inside an `rpc` span, whenever the inner service runs.
//!
//! The transaction id is echoed back in the `app-transaction` response
//! header so callers can correlate server logs with their request.

use super::transaction::extract_transaction_id;
use callscope_core::{
    context::{
        CallContext, METHOD_NAME, REQUEST_START_TIME, TRANSACTION_ID, WithCallContextExt,
    },
    types::TRANSACTION_HEADER,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};
use tonic::codegen::http::{self, HeaderMap, HeaderValue};
use tracing::Instrument;

/// Builds the context of a call from its request path and headers.
pub fn build_call_context(path: &str, headers: &HeaderMap) -> CallContext {
    CallContext::current()
        .with_value(TRANSACTION_ID, extract_transaction_id(headers))
        .with_value(METHOD_NAME, method_name(path).to_string())
        .with_value(REQUEST_START_TIME, now_millis())
}

/// `/package.Service/Method` -> `package.Service/Method`
fn method_name(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Span every call runs in.
pub fn call_span(ctx: &CallContext) -> tracing::Span {
    tracing::info_span!(
        "rpc",
        method = ctx.method_name().unwrap_or_default(),
        transaction_id = ctx.transaction_id().unwrap_or_default(),
    )
}

/// Registers the call interceptor ahead of every service on the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContextLayer;

impl<S> tower::Layer<S> for CallContextLayer {
    type Service = CallContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallContextService { inner }
    }
}

/// Tower service produced by [`CallContextLayer`].
#[derive(Debug, Clone)]
pub struct CallContextService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> tower::Service<http::Request<ReqBody>> for CallContextService<S>
where
    S: tower::Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<ReqBody>) -> Self::Future {
        let ctx = build_call_context(request.uri().path(), request.headers());
        let span = call_span(&ctx);
        let echo = ctx
            .transaction_id()
            .and_then(|txn| HeaderValue::from_str(&txn).ok());

        request.extensions_mut().insert(ctx.clone());

        let future = {
            let _ambient = ctx.attach();
            let _entered = span.enter();
            self.inner.call(request)
        };

        Box::pin(
            async move {
                let mut response = future.await?;
                if let Some(echo) = echo {
                    response.headers_mut().insert(TRANSACTION_HEADER, echo);
                }
                Ok(response)
            }
            .with_call_context(ctx)
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::sync::{Arc, Mutex};
    use tower::{Layer, Service, ServiceExt, service_fn};

    fn request(path: &str, txn: Option<&'static str>) -> http::Request<()> {
        let mut builder = http::Request::builder().uri(path);
        if let Some(txn) = txn {
            builder = builder.header(TRANSACTION_HEADER, txn);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn context_has_all_keys() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSACTION_HEADER, HeaderValue::from_static("X"));

        let before = now_millis();
        let ctx = build_call_context("/callscope.v1.CallScope/GetOne", &headers);
        let after = now_millis();

        assert_eq!(ctx.transaction_id().as_deref(), Some("X"));
        assert_eq!(
            ctx.method_name().as_deref(),
            Some("callscope.v1.CallScope/GetOne")
        );
        let start = ctx.request_start_time().unwrap();
        assert!(before <= start && start <= after);
        assert_eq!(ctx.len(), 3);
    }

    #[tokio::test]
    async fn layer_stamps_extensions_and_echoes_header() {
        let seen = Arc::new(Mutex::new(None::<(CallContext, bool)>));
        let recorder = Arc::clone(&seen);
        let inner = service_fn(move |req: http::Request<()>| {
            let recorder = Arc::clone(&recorder);
            async move {
                let ctx = req.extensions().get::<CallContext>().cloned().unwrap();
                let ambient = CallContext::current().ptr_eq(&ctx);
                *recorder.lock().unwrap() = Some((ctx, ambient));
                Ok::<_, Infallible>(http::Response::new(()))
            }
        });

        let mut service = CallContextLayer.layer(inner);
        let response = service
            .ready()
            .await
            .unwrap()
            .call(request("/callscope.v1.CallScope/BiStream", Some("abc")))
            .await
            .unwrap();

        assert_eq!(response.headers().get(TRANSACTION_HEADER).unwrap(), "abc");
        let (ctx, ambient) = seen.lock().unwrap().take().unwrap();
        assert!(ambient);
        assert_eq!(ctx.transaction_id().as_deref(), Some("abc"));
        assert_eq!(
            ctx.method_name().as_deref(),
            Some("callscope.v1.CallScope/BiStream")
        );
        // Nothing leaks past the dispatch.
        assert!(CallContext::current().is_root());
    }

    #[tokio::test]
    async fn calls_without_header_get_distinct_ids() {
        let inner = service_fn(|_req: http::Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(()))
        });
        let mut service = CallContextLayer.layer(inner);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = service
                .ready()
                .await
                .unwrap()
                .call(request("/callscope.v1.CallScope/GetOne", None))
                .await
                .unwrap();
            let id = response.headers().get(TRANSACTION_HEADER).unwrap();
            ids.push(id.to_str().unwrap().to_string());
        }
        assert_ne!(ids[0], ids[1]);
    }
}
