//! Global `tracing` subscriber setup.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the configured
//! level string (e.g. `"info"` or `"hb_tunnel=debug,info"`). Installing a
//! subscriber twice is harmless: the second attempt is ignored, which keeps
//! tests that each call `init_logging` independent.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; everything else is human-readable.
    pub fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogFormat::Human => "human-readable",
            LogFormat::Json => "json",
        }
    }
}

pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter = filter_or(default_level);
    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .compact()
            .try_init()
            .is_ok(),
        // Thread names identify the transport and tunnel monitor threads.
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, format = format.label(), "logging ready");
    }
}

/// Compact human-readable output.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// One JSON object per event, for log shippers.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}

fn filter_or(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
