//! Per-call interception.
//!
//! - [`transaction`] - derives the transaction id from inbound metadata.
//! - [`layer`] - tower layer stamping a [`CallContext`] on every inbound
//!   call before it reaches a handler.
//! - [`listener`] - decorator that activates the call's context and
//!   publishes it to the logging context around the half-close callback.
//!
//! [`CallContext`]: callscope_core::context::CallContext

pub mod layer;
pub mod listener;
pub mod transaction;

pub use layer::CallContextLayer;
pub use listener::{ContextHook, wrap};
