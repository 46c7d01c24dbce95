//! # Shared constants and shape identifiers
//!
//! Names that both sides of a call agree on: the metadata key a caller uses
//! to propagate its transaction id, the key under which that id is exposed to
//! log call sites, and the labels attached to every diagnostic event emitted
//! by a handler.

use core::fmt;

/// ASCII metadata key a caller may set to propagate an existing transaction
/// id. When absent or empty the server mints a new one.
pub const TRANSACTION_HEADER: &str = "app-transaction";

/// Key under which the transaction id is published in the
/// [`LogContext`](crate::log_context::LogContext).
pub const LOG_TRANSACTION_KEY: &str = "app-transaction";

/// Placeholder payload carried by every response.
pub const DEFAULT_PAYLOAD: [f64; 5] = [1.0, 2.0, 3.0, 4.0, 5.0];

/// Number of responses a server-streaming call emits for its single request.
pub const DEFAULT_SERVER_STREAM_BURST: usize = 5;

/// Number of responses a bidirectional call emits per client message.
pub const DEFAULT_BIDI_BURST: usize = 3;

/// The four gRPC interaction shapes served by the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamShape {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidirectional,
}

impl StreamShape {
    /// Label used in the `shape` field of diagnostic events.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamShape::Unary => "get_one",
            StreamShape::ClientStreaming => "client_stream",
            StreamShape::ServerStreaming => "server_stream",
            StreamShape::Bidirectional => "bi_stream",
        }
    }
}

impl fmt::Display for StreamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
