//! Task processing: the handler registry, the engine and the worker.
//!
//! The [`Worker`] is the public face. It owns a [`HandlerRegistry`] filled
//! before construction, wraps every handler in the middleware chain when it
//! starts and hands the result to the engine, which leases tasks from the
//! broker and records each outcome.

pub(crate) mod engine;
pub mod registry;
pub mod worker;

pub use registry::HandlerRegistry;
pub use worker::Worker;
