//! Server-side components of the `callscope` endpoint.
//!
//! ## Submodules
//!
//! - [`config`] - CLI and environment configuration.
//! - [`interceptor`] - per-call context establishment and half-close
//!   decoration.
//! - [`lifecycle`] - in-flight call accounting and graceful shutdown.
//! - [`service`] - the gRPC service and the business logic of each shape.
//! - [`streaming`] - inbound event delivery.
//! - [`telemetry`] - structured logging and optional OpenTelemetry export.
//!
//! [`serve`] wires them together on a tonic server.

pub mod config;
pub mod interceptor;
pub mod lifecycle;
pub mod service;
pub mod streaming;
pub mod telemetry;

#[cfg(test)]
mod tests;

use callscope_core::proto::{FILE_DESCRIPTOR_SET, call_scope_server::CallScopeServer};
use core::time::Duration;
use futures::Stream;
use interceptor::CallContextLayer;
use service::handler::CallScopeService;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::{
    codec::CompressionEncoding,
    transport::{Server, server::Connected},
};
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

/// Serves `service` on `incoming` until `signal` resolves.
///
/// Once `signal` resolves the health status flips to not-serving and the
/// service drains its in-flight calls for up to `drain_timeout` before the
/// transport stops.
pub async fn serve<I, IO, IE, F>(
    service: CallScopeService,
    incoming: I,
    drain_timeout: Duration,
    signal: F,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<CallScopeServer<CallScopeService>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let shutdown = {
        let service = service.clone();
        async move {
            signal.await;
            tracing::info!("Shutdown signal received, terminating gracefully...");

            // 1. Publish the status
            health_reporter
                .set_not_serving::<CallScopeServer<CallScopeService>>()
                .await;

            // 2. Drain and cancel in-flight calls
            service.shutdown(drain_timeout).await;
        }
    };

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new())
                .layer(CallContextLayer),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_call_scope_service(service))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

fn build_call_scope_service(service: CallScopeService) -> CallScopeServer<CallScopeService> {
    CallScopeServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}
