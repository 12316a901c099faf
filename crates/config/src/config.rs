use std::{fs, path::Path};

use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};
use utxord_btc_types::fee::DUST_RELAY_FEE;

use crate::ConfigError;

/// Default value for `network` in [`Config`].
const DEFAULT_NETWORK: Network = Network::Regtest;

/// Default value for `default_mining_fee_rate` in [`FeeConfig`], sat/kvB.
const DEFAULT_MINING_FEE_RATE: Amount = Amount::from_sat(1000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Network every address in a contract has to belong to.
    #[serde(default = "default_network")]
    pub network: Network,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub fees: FeeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact format.
    #[serde(default)]
    pub json: bool,

    /// `EnvFilter` directives used when `RUST_LOG` is not set.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Mining fee rate in sat/kvB applied when a contract does not set its own.
    #[serde(default = "default_mining_fee_rate", with = "bitcoin::amount::serde::as_sat")]
    pub default_mining_fee_rate: Amount,

    /// Relay fee rate in sat/kvB the dust threshold is derived from.
    #[serde(default = "default_dust_relay_fee", with = "bitcoin::amount::serde::as_sat")]
    pub dust_relay_fee: Amount,
}

fn default_network() -> Network {
    DEFAULT_NETWORK
}

fn default_mining_fee_rate() -> Amount {
    DEFAULT_MINING_FEE_RATE
}

fn default_dust_relay_fee() -> Amount {
    DUST_RELAY_FEE
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            default_mining_fee_rate: DEFAULT_MINING_FEE_RATE,
            dust_relay_fee: DUST_RELAY_FEE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK,
            logging: LoggingConfig::default(),
            fees: FeeConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fees.default_mining_fee_rate == Amount::ZERO {
            return Err(ConfigError::Invalid("fees.default_mining_fee_rate must be positive".into()));
        }
        if self.fees.dust_relay_fee == Amount::ZERO {
            return Err(ConfigError::Invalid("fees.dust_relay_fee must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            network = "signet"

            [logging]
            json = true
            filter = "utxord_contract=debug"

            [fees]
            default_mining_fee_rate = 2500
            dust_relay_fee = 1000
        "#,
        )
        .expect("valid config");

        assert_eq!(config.network, Network::Signet);
        assert!(config.logging.json);
        assert_eq!(config.logging.filter.as_deref(), Some("utxord_contract=debug"));
        assert_eq!(config.fees.default_mining_fee_rate, Amount::from_sat(2500));
        assert_eq!(config.fees.dust_relay_fee, Amount::from_sat(1000));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = Config::from_toml_str("").expect("empty config");
        assert_eq!(config, Config::default());
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.fees.dust_relay_fee, DUST_RELAY_FEE);

        let config = Config::from_toml_str("[fees]\ndefault_mining_fee_rate = 3000\n").expect("partial fees");
        assert_eq!(config.fees.dust_relay_fee, DUST_RELAY_FEE);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::from_toml_str("network = \"moon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[fees]\ndefault_mining_fee_rate = 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/utxord.toml").expect_err("no such file");
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/utxord.toml"));
    }
}
