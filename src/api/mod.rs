//! HTTP API Module
//!
//! Serves the peer protocol, the lock and the booking endpoints.

mod http;

pub use http::{create_router, AppState, ErrorResponse, HttpServer};
