//! Logging setup for Proxy Chat Server.
//!
//! Two flavours share the same filter: JSON lines for production
//! (`PROXYCHAT_LOG_FORMAT=json`) and pretty console output for local
//! development.
//!
//! # Configuration
//!
//! - `RUST_LOG`: Log filter (default: `info,proxychat_server=debug,proxychat_delivery=debug`)
//! - `PROXYCHAT_LOG_FORMAT`: `json` for structured output, anything else for pretty

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,proxychat_server=debug,proxychat_delivery=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Whether the environment asks for JSON logs.
pub fn json_requested() -> bool {
    std::env::var("PROXYCHAT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialize structured JSON logging.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("JSON telemetry initialized");

    Ok(())
}

/// Initialize logging for local development.
///
/// Console output with colored logs.
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Local telemetry initialized");

    Ok(())
}
