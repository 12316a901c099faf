//! Logging subsystem built on `tracing-subscriber`.

mod manager;
mod types;

#[cfg(test)]
mod tests;

pub use manager::{init, try_init};
pub use types::{LoggerConfig, StdoutConfig};
