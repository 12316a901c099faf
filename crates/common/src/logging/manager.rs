//! Logging initialization.

use std::env;

use tracing::{info, Level};
use tracing_subscriber::{
    fmt::layer,
    layer::SubscriberExt,
    registry,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

use super::types::LoggerConfig;

/// Filter from `RUST_LOG` when it is set, else from the configured directives, with INFO for
/// everything no directive names.
pub(super) fn build_filter(env_directives: Option<&str>, configured: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(Level::INFO.into());
    match env_directives.filter(|d| !d.is_empty()) {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.parse_lossy(configured.unwrap_or_default()),
    }
}

fn stdout_layer(config: &LoggerConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let env_directives = env::var(EnvFilter::DEFAULT_ENV).ok();
    let filt = build_filter(env_directives.as_deref(), config.filter.as_deref());

    if config.stdout_config.json_format {
        layer()
            .json()
            .with_span_events(config.stdout_config.fmt_span.clone())
            .with_filter(filt)
            .boxed()
    } else {
        layer()
            .compact()
            .with_span_events(config.stdout_config.fmt_span.clone())
            .with_filter(filt)
            .boxed()
    }
}

/// Initializes the logging subsystem with the provided config.
///
/// Panics when a global subscriber is already installed.
pub fn init(config: LoggerConfig) {
    registry().with(stdout_layer(&config)).init();
    log_initialized(&config);
}

/// Like [`init`], but leaves an already installed subscriber in place and reports it.
pub fn try_init(config: LoggerConfig) -> Result<(), TryInitError> {
    registry().with(stdout_layer(&config)).try_init()?;
    log_initialized(&config);
    Ok(())
}

fn log_initialized(config: &LoggerConfig) {
    info!(
        service_name = %config.service_name,
        json = config.stdout_config.json_format,
        "logging initialized"
    );
}
