//! Logging and request correlation for hybrid-bridge services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Correlation**: `X-Request-Id` middleware for the HTTP transport and
//!   per-dispatch operation spans

pub mod logging;
pub mod tracing_setup;
