//! Shared protocol, context, and observer definitions.
//!
//! - [`context`] - Immutable per-call key/value context and the ambient
//!   (thread-local) current context.
//! - [`log_context`] - Thread-local store read by log call sites.
//! - [`observer`] - The `on_next`/`on_error`/`on_completed` contract and the
//!   outbound [`ResponseObserver`](observer::ResponseObserver).
//! - [`error`] - Unified error type and its mapping onto [`tonic::Status`].
//! - [`types`] - Metadata keys, shape names, and default payload constants.
//! - [`proto`] - Generated gRPC bindings for `proto/callscope.proto`.

pub mod context;
pub mod error;
pub mod log_context;
pub mod observer;
pub mod types;

pub use error::{Error, Result};

/// gRPC service and message definitions generated from
/// `proto/callscope.proto`.
///
/// ## Service
///
/// - `GetOne` - unary
/// - `ClientStream` - client-streaming
/// - `ServerStream` - server-streaming
/// - `BiStream` - bidirectional-streaming
///
/// All four methods exchange [`Request`](proto::Request) and
/// [`Response`](proto::Response) messages.
pub mod proto {
    tonic::include_proto!("callscope.v1");

    /// Encoded file descriptor set used to register gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("callscope_descriptor");
}
