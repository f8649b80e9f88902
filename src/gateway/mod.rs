//! HTTP gateway: router, handlers, middleware, and the live feed.

pub mod auth;
pub mod server;
pub mod sse;
pub mod types;
pub mod upload;
