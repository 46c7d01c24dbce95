//! Error types for the call-scoped gRPC endpoint.
//!
//! This module defines the central `Error` enum, which captures all reportable
//! error cases of a single call. It implements `From<Error>` for
//! `tonic::Status` so handlers can surface failures to the caller with the
//! appropriate status code.
//!
//! ## Error Cases
//! - `InvalidRequest`: The request content was rejected by validation.
//! - `Internal`: Processing failed. Only the description reaches the caller;
//!   the cause stays on the server for diagnostics.
//! - `StreamAborted`: The client (or transport) terminated a stream with an
//!   error.
//! - `ContextMissing`: A call reached a handler without its call context.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use std::sync::Arc;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for a single call.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request content is malformed or not allowed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Processing failed inside the handler.
    #[error("Internal error: {description}")]
    Internal {
        description: String,
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// The inbound stream terminated with an error.
    #[error("Stream aborted: {status}")]
    StreamAborted { status: Status },

    /// No call context was attached to the request.
    #[error("Call context missing for {method}")]
    ContextMissing { method: &'static str },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// An internal failure that keeps `cause` for server-side diagnostics.
    pub fn internal<E>(description: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Internal {
            description: description.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// An internal failure without an underlying error value.
    pub fn internal_msg(description: impl Into<String>) -> Self {
        Error::Internal {
            description: description.into(),
            cause: None,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            // The cause is intentionally dropped here and never serialized.
            Error::Internal { description, .. } => Status::internal(description),
            Error::StreamAborted { status } => status,
            Error::ContextMissing { method } => {
                Status::internal(format!("Call context missing for {method}"))
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
