//! HTTP server layer.
//!
//! Submodules:
//! - `api`: axum routes and request/response types

pub mod api;
