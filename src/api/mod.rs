//! Client-facing HTTP API

pub mod client_http;

pub use client_http::{create_client_router, ErrorResponse};
