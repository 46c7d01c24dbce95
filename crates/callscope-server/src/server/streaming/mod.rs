//! Inbound event delivery.
//!
//! ## Structure
//!
//! - [`driver`] - pumps an inbound message stream into a call listener.
//! - [`single`] - buffers the single request of unary and server-streaming
//!   calls until half-close.

pub mod driver;
pub mod single;
