//! Terms shared by every contract builder.

use bitcoin::{Address, Amount, Network, Script};
use serde::{Deserialize, Serialize};
use utxord_btc_types::{
    fee::{dust_floor, tx_fee, TAPROOT_KEYSPEND_VIN_VSIZE, TAPROOT_VOUT_VSIZE},
    parse_address, ContractError, Destination, DestinationRepr,
};
use utxord_config::Config;

use crate::reconcile;

pub const NAME_MINING_FEE_RATE: &str = "mining_fee_rate";
pub const NAME_MARKET_FEE: &str = "market_fee";
pub const NAME_CUSTOM_FEES: &str = "custom_fees";
pub const NAME_CHANGE_ADDR: &str = "change_addr";

/// Fee rate, market fee, custom fees and change address of a contract.
///
/// The network and the dust relay fee come from the local [`Config`]. Its default mining fee
/// rate only prices quotes while no rate has been agreed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractBuilder {
    config: Config,
    mining_fee_rate: Option<Amount>,
    market_fee: Option<Destination>,
    custom_fees: Vec<Destination>,
    change_addr: Option<Address>,
}

/// JSON shape of the shared terms, flattened into each contract's params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonParams {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bitcoin::amount::serde::as_sat::opt"
    )]
    pub mining_fee_rate: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_fee: Option<DestinationRepr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_fees: Vec<DestinationRepr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_addr: Option<String>,
}

impl ContractBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            mining_fee_rate: None,
            market_fee: None,
            custom_fees: Vec::new(),
            change_addr: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn mining_fee_rate(&self) -> Option<Amount> {
        self.mining_fee_rate
    }

    pub fn require_mining_fee_rate(&self) -> Result<Amount, ContractError> {
        self.mining_fee_rate
            .ok_or_else(|| ContractError::State(format!("{NAME_MINING_FEE_RATE} not defined")))
    }

    /// Agreed rate, or the configured default while none is agreed. Only for estimates; every
    /// transaction is built at the agreed rate.
    pub fn quote_mining_fee_rate(&self) -> Amount {
        self.mining_fee_rate
            .unwrap_or(self.config.fees.default_mining_fee_rate)
    }

    pub fn set_mining_fee_rate(&mut self, rate: Amount) -> Result<(), ContractError> {
        reconcile(&mut self.mining_fee_rate, Some(rate), NAME_MINING_FEE_RATE)
    }

    pub fn dust_floor(&self, script: &Script) -> Amount {
        dust_floor(script, self.config.fees.dust_relay_fee)
    }

    pub fn is_dust(&self, dest: &Destination) -> bool {
        dest.is_dust_at(self.config.fees.dust_relay_fee)
    }

    pub fn check_dust(&self, dest: &Destination, name: &str) -> Result<(), ContractError> {
        dest.check_dust_at(name, self.config.fees.dust_relay_fee)
    }

    pub fn market_fee(&self) -> Option<&Destination> {
        self.market_fee.as_ref()
    }

    pub fn require_market_fee(&self) -> Result<&Destination, ContractError> {
        self.market_fee
            .as_ref()
            .ok_or_else(|| ContractError::State(format!("{NAME_MARKET_FEE} not defined")))
    }

    /// Market fee paid to `addr`; a zero amount means no market fee output at all.
    pub fn set_market_fee(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let fee = self.fee_destination(amount, addr, NAME_MARKET_FEE)?;
        reconcile(&mut self.market_fee, Some(fee), NAME_MARKET_FEE)
    }

    pub fn custom_fees(&self) -> &[Destination] {
        &self.custom_fees
    }

    pub fn add_custom_fee(&mut self, amount: Amount, addr: &str) -> Result<(), ContractError> {
        let name = format!("{NAME_CUSTOM_FEES}[{}]", self.custom_fees.len());
        let fee = self.fee_destination(amount, addr, &name)?;
        self.custom_fees.push(fee);
        Ok(())
    }

    pub fn custom_fees_amount(&self) -> Amount {
        self.custom_fees.iter().map(Destination::amount).sum()
    }

    pub fn change_addr(&self) -> Option<&Address> {
        self.change_addr.as_ref()
    }

    pub fn require_change_addr(&self) -> Result<&Address, ContractError> {
        self.change_addr
            .as_ref()
            .ok_or_else(|| ContractError::State(format!("{NAME_CHANGE_ADDR} not defined")))
    }

    pub fn set_change_addr(&mut self, addr: &str) -> Result<(), ContractError> {
        let addr = parse_address(addr, self.network())?;
        reconcile(&mut self.change_addr, Some(addr), NAME_CHANGE_ADDR)
    }

    /// Marginal fee of one more taproot key-path input.
    pub fn new_input_mining_fee(&self) -> Amount {
        tx_fee(self.quote_mining_fee_rate(), TAPROOT_KEYSPEND_VIN_VSIZE)
    }

    /// Marginal fee of one more taproot output.
    pub fn new_output_mining_fee(&self) -> Amount {
        tx_fee(self.quote_mining_fee_rate(), TAPROOT_VOUT_VSIZE)
    }

    /// Fee output paid to `addr`; a zero amount means no output at all.
    pub(crate) fn fee_destination(&self, amount: Amount, addr: &str, name: &str) -> Result<Destination, ContractError> {
        if amount == Amount::ZERO {
            return Ok(Destination::Zero);
        }
        let dest = Destination::from_addr_str(amount, addr, self.network())
            .map_err(|e| ContractError::TermWrongValue(name.to_owned()).caused_by(e))?;
        self.check_dust(&dest, name)?;
        Ok(dest)
    }

    /// Shared terms to emit; each flag tells whether the phase being serialized shows the term.
    pub fn make_params(&self, with_fee_rate: bool, with_market_fee: bool, with_change: bool) -> CommonParams {
        CommonParams {
            mining_fee_rate: self.mining_fee_rate.filter(|_| with_fee_rate),
            market_fee: self
                .market_fee
                .as_ref()
                .filter(|_| with_market_fee)
                .map(Destination::to_repr),
            custom_fees: if with_market_fee {
                self.custom_fees.iter().map(Destination::to_repr).collect()
            } else {
                Vec::new()
            },
            change_addr: self
                .change_addr
                .as_ref()
                .filter(|_| with_change)
                .map(Address::to_string),
        }
    }

    pub fn merge_params(&mut self, params: CommonParams) -> Result<(), ContractError> {
        reconcile(&mut self.mining_fee_rate, params.mining_fee_rate, NAME_MINING_FEE_RATE)?;

        let market_fee = params
            .market_fee
            .map(|repr| Destination::from_repr(repr, self.network()))
            .transpose()
            .map_err(|e| ContractError::TermWrongValue(NAME_MARKET_FEE.into()).caused_by(e))?;
        reconcile(&mut self.market_fee, market_fee, NAME_MARKET_FEE)?;

        if !params.custom_fees.is_empty() {
            let fees = params
                .custom_fees
                .into_iter()
                .map(|repr| Destination::from_repr(repr, self.network()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ContractError::TermWrongValue(NAME_CUSTOM_FEES.into()).caused_by(e))?;
            if self.custom_fees.is_empty() {
                self.custom_fees = fees;
            } else if self.custom_fees != fees {
                return Err(ContractError::TermMismatch(NAME_CUSTOM_FEES.into()));
            }
        }

        let change_addr = params
            .change_addr
            .map(|addr| parse_address(&addr, self.network()))
            .transpose()?;
        reconcile(&mut self.change_addr, change_addr, NAME_CHANGE_ADDR)
    }
}

/// Rejects legacy address destinations for protocol versions predating them.
pub(crate) fn check_p2address(
    dest: &Destination,
    version: u32,
    last_unsupported: u32,
    name: &str,
) -> Result<(), ContractError> {
    if dest.is_p2address() && version <= last_unsupported {
        return Err(ContractError::Protocol(format!(
            "{name}: {} is not supported with v. {version}",
            dest.address().map(Address::to_string).unwrap_or_default()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        secp256k1::{Keypair, SECP256K1},
        CompressedPublicKey,
    };

    use super::*;

    fn p2wpkh_addr(byte: u8) -> String {
        let kp = Keypair::from_seckey_slice(SECP256K1, &[byte; 32]).expect("valid key");
        Address::p2wpkh(&CompressedPublicKey(kp.public_key()), Network::Regtest).to_string()
    }

    #[test]
    fn test_fee_rate_is_set_once() {
        let mut config = Config::default();
        config.fees.default_mining_fee_rate = Amount::from_sat(2000);
        let mut builder = ContractBuilder::new(&config);
        assert!(builder.require_mining_fee_rate().is_err(), "no rate yet");
        assert_eq!(builder.new_input_mining_fee(), Amount::from_sat(116), "quoted at the default");

        builder.set_mining_fee_rate(Amount::from_sat(1000)).expect("first rate");
        builder.set_mining_fee_rate(Amount::from_sat(1000)).expect("same rate");
        let err = builder
            .set_mining_fee_rate(Amount::from_sat(2000))
            .expect_err("different rate");
        assert_eq!(err.kind(), utxord_btc_types::ErrorKind::TermMismatch);

        assert_eq!(builder.new_input_mining_fee(), Amount::from_sat(58));
        assert_eq!(builder.new_output_mining_fee(), Amount::from_sat(43));
    }

    #[test]
    fn test_zero_market_fee_has_no_output() {
        let mut builder = ContractBuilder::new(&Config::default());
        builder.set_market_fee(Amount::ZERO, "").expect("zero fee needs no address");
        assert!(builder.market_fee().is_some_and(Destination::is_zero));
    }

    #[test]
    fn test_dust_market_fee_is_rejected() {
        let mut builder = ContractBuilder::new(&Config::default());
        let err = builder
            .set_market_fee(Amount::from_sat(100), &p2wpkh_addr(1))
            .expect_err("dust");
        assert_eq!(err.kind(), utxord_btc_types::ErrorKind::Dust);
    }

    #[test]
    fn test_dust_follows_configured_relay_fee() {
        let mut default = ContractBuilder::new(&Config::default());
        default.set_market_fee(Amount::from_sat(500), &p2wpkh_addr(1)).expect("above 294");

        let mut config = Config::default();
        config.fees.dust_relay_fee = Amount::from_sat(6000);
        let mut strict = ContractBuilder::new(&config);
        let err = strict
            .set_market_fee(Amount::from_sat(500), &p2wpkh_addr(1))
            .expect_err("below 588");
        assert_eq!(err.kind(), utxord_btc_types::ErrorKind::Dust);

        let fee = default.market_fee().expect("market fee");
        assert!(!default.is_dust(fee));
        assert!(strict.is_dust(fee));
        assert_eq!(strict.dust_floor(&fee.script_pubkey().expect("script")), Amount::from_sat(588));
    }

    #[test]
    fn test_params_merge_into_empty_builder() {
        let mut builder = ContractBuilder::new(&Config::default());
        builder.set_mining_fee_rate(Amount::from_sat(1500)).expect("rate");
        builder.set_market_fee(Amount::from_sat(1000), &p2wpkh_addr(1)).expect("fee");
        builder.add_custom_fee(Amount::from_sat(600), &p2wpkh_addr(2)).expect("custom");
        builder.set_change_addr(&p2wpkh_addr(3)).expect("change");

        let params = builder.make_params(true, true, true);
        let mut other = ContractBuilder::new(&Config::default());
        other.merge_params(params.clone()).expect("merge");
        assert_eq!(other, builder);

        other.merge_params(params).expect("idempotent");
        assert_eq!(other.custom_fees_amount(), Amount::from_sat(600));

        let hidden = builder.make_params(false, true, false);
        assert!(hidden.mining_fee_rate.is_none());
        assert!(hidden.change_addr.is_none());
    }
}
