//! gRPC service implementation.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC entry point (`CallScopeService`), adapting calls to
//!   listeners and response streams.
//! - [`shapes`] - transport-agnostic business logic of the four interaction
//!   shapes.

pub mod handler;
pub mod shapes;
