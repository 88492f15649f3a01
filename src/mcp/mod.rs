//! Model Context Protocol engine
//!
//! The message model, the per-connection session and its registries, and the server
//! that dispatches decoded messages to core methods or the application handler.

pub mod cancellation;
pub mod context;
pub mod method;
pub mod progress;
pub mod rpc;
pub mod server;
pub mod session;
pub mod sessions;
pub mod subscriptions;
