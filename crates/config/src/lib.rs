//! Configuration shared by the tools driving utxord contracts.

mod config;
mod errors;

pub use config::{Config, FeeConfig, LoggingConfig};
pub use errors::ConfigError;
