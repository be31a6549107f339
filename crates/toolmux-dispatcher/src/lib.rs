//! The request dispatcher (C9): composes the rate limiter, connection
//! queue, circuit breaker registry, schema cache, schema validator, and
//! downstream pool into the single pipeline every sandbox tool call runs
//! through.

mod dispatcher;

pub use dispatcher::{Dispatcher, ToolCallRequest};
