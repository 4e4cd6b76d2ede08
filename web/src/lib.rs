//! Axum integration for BlajarPlus.
//!
//! This crate holds the HTTP plumbing that is not specific to any one
//! marketplace feature:
//!
//! - [`AppError`]: the single error type handlers return, rendered as
//!   `{"code": ..., "message": ...}`
//! - Extractors for correlation IDs, client IPs, user agents, and JSON/query
//!   bodies that reject with [`AppError`]
//! - The correlation ID middleware layer
//! - Liveness and readiness handlers
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at an Axum handler
//! 2. **Extract data** from the request (JSON, query, bearer token)
//! 3. **Call a service** or build an action for a reducer
//! 4. **Map result** to an HTTP response or an [`AppError`]

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

pub use error::AppError;
pub use extractors::{ApiJson, ApiQuery, ClientIp, CorrelationId, UserAgent};
pub use middleware::{correlation_id_layer, CORRELATION_ID_HEADER};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
