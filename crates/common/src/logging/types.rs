//! Configuration types for the logging subsystem.

use tracing_subscriber::fmt::format::FmtSpan;
use utxord_config::LoggingConfig;

/// Configuration for the stdout logging layer
#[derive(Debug, Clone)]
pub struct StdoutConfig {
    /// Use JSON format instead of compact format
    pub json_format: bool,
    /// Span events to log (ENTER, EXIT, CLOSE, etc.)
    pub fmt_span: FmtSpan,
}

impl Default for StdoutConfig {
    fn default() -> Self {
        Self {
            json_format: false,
            fmt_span: FmtSpan::NONE,
        }
    }
}

/// Main logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub service_name: String,
    /// Directives applied when `RUST_LOG` is not set
    pub filter: Option<String>,
    pub stdout_config: StdoutConfig,
}

impl LoggerConfig {
    pub fn new(service_name: String) -> Self {
        Self {
            service_name,
            filter: None,
            stdout_config: StdoutConfig::default(),
        }
    }

    /// Takes format and filter from the `[logging]` section of the config file.
    pub fn from_config(service_name: String, config: &LoggingConfig) -> Self {
        Self::new(service_name)
            .with_json_logging(config.json)
            .with_filter(config.filter.clone())
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.stdout_config.json_format = enabled;
        self
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_fmt_span(mut self, fmt_span: FmtSpan) -> Self {
        self.stdout_config.fmt_span = fmt_span;
        self
    }
}
