//! Unit tests for the logging subsystem.

use tracing_subscriber::filter::LevelFilter;
use utxord_config::Config;

use super::{manager::build_filter, try_init, types::*};

#[test]
fn test_logger_config_new() {
    let config = LoggerConfig::new("utxord".to_string());
    assert_eq!(config.service_name, "utxord");
    assert_eq!(config.filter, None);
    assert!(!config.stdout_config.json_format);
}

#[test]
fn test_logger_config_from_file_section() {
    let file = Config::from_toml_str(
        r#"
        [logging]
        json = true
        filter = "utxord_contract=trace"
    "#,
    )
    .expect("valid config");

    let config = LoggerConfig::from_config("utxord".to_string(), &file.logging);
    assert!(config.stdout_config.json_format);
    assert_eq!(config.filter.as_deref(), Some("utxord_contract=trace"));
}

#[test]
fn test_default_level_is_info() {
    assert_eq!(build_filter(None, None).max_level_hint(), Some(LevelFilter::INFO));
    assert_eq!(build_filter(Some(""), None).max_level_hint(), Some(LevelFilter::INFO));
}

#[test]
fn test_configured_directives() {
    let filter = build_filter(None, Some("utxord_contract=debug"));
    assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
}

#[test]
fn test_env_overrides_configured_directives() {
    let filter = build_filter(Some("trace"), Some("utxord_contract=debug"));
    assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
}

#[test]
fn test_second_init_is_reported() {
    let _ = try_init(LoggerConfig::new("utxord".to_string()));
    assert!(try_init(LoggerConfig::new("utxord".to_string())).is_err());
}
