//! Fee rates, per-shape vsize constants and the output amount solver.
//!
//! Fee rates are [`Amount`]s per 1000 virtual bytes.

use std::str::FromStr;

use bitcoin::{Amount, FeeRate, Script, Transaction};

use crate::ContractError;

pub const TX_BASE_VSIZE: usize = 10;
pub const TAPROOT_VOUT_VSIZE: usize = 43;
pub const P2WPKH_VOUT_VSIZE: usize = 31;
pub const TAPROOT_KEYSPEND_VIN_VSIZE: usize = 58;
pub const P2WPKH_VIN_VSIZE: usize = 68;
pub const TAPROOT_MULTISIG_VIN_VSIZE: usize = 108;
pub const MIN_TAPROOT_TX_VSIZE: usize = TX_BASE_VSIZE + TAPROOT_VOUT_VSIZE + TAPROOT_KEYSPEND_VIN_VSIZE;
pub const TX_SWAP_BASE_VSIZE: usize = 413;
pub const COLLECTION_SCRIPT_ADD_VSIZE: usize = 18;

/// Protocol-wide dust amount, in satoshis.
pub const BITCOIN_DUST_LIMIT: u64 = 546;

/// Relay fee rate the per-script dust floors derive from.
pub const DUST_RELAY_FEE: Amount = Amount::from_sat(3000);

pub fn dust_limit() -> Amount {
    Amount::from_sat(BITCOIN_DUST_LIMIT)
}

/// Smallest relayable value of an output paying `script` at `dust_relay_fee` per 1000 vbytes.
///
/// The rate is taken in whole satoshis per 1000 weight units, so it is rounded down to a
/// multiple of 4.
pub fn dust_floor(script: &Script, dust_relay_fee: Amount) -> Amount {
    script.minimal_non_dust_custom(FeeRate::from_sat_per_kwu(dust_relay_fee.to_sat() / 4))
}

/// Fee for `vsize` virtual bytes at `rate`, rounded up to the next satoshi.
pub fn tx_fee(rate: Amount, vsize: usize) -> Amount {
    Amount::from_sat((rate.to_sat() * vsize as u64).div_ceil(1000))
}

/// Value for output `vout` such that the transaction pays exactly `tx_fee(rate, vsize)`.
///
/// The other outputs keep their values; `tx` must already carry correctly sized witnesses.
pub fn calculate_output_amount(
    total_in: Amount,
    rate: Amount,
    tx: &Transaction,
    vout: usize,
) -> Result<Amount, ContractError> {
    let others: Amount = tx
        .output
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != vout)
        .map(|(_, out)| out.value)
        .sum();
    let required = others + tx_fee(rate, tx.vsize());

    total_in
        .checked_sub(required)
        .ok_or_else(|| ContractError::FundsNotEnough {
            context: format!("output {vout}"),
            required: required.to_sat(),
            available: total_in.to_sat(),
        })
}

/// Actual fee paid by `tx` spending `total_in`.
pub fn paid_fee(total_in: Amount, tx: &Transaction) -> Option<Amount> {
    let total_out: Amount = tx.output.iter().map(|out| out.value).sum();
    total_in.checked_sub(total_out)
}

/// Switches for parts of a transaction not known yet when estimating its fee.
///
/// Parsed from a comma separated list such as `"change,p2wpkh_utxo"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeOptions {
    pub change: bool,
    pub collection: bool,
    pub extra_utxo: bool,
    pub p2wpkh_utxo: bool,
}

impl FromStr for FeeOptions {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = FeeOptions::default();
        for opt in s.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
            match opt {
                "change" => opts.change = true,
                "collection" => opts.collection = true,
                "extra_utxo" => opts.extra_utxo = true,
                "p2wpkh_utxo" => opts.p2wpkh_utxo = true,
                other => {
                    return Err(ContractError::TermWrongValue(format!(
                        "unknown fee option: {other}"
                    )))
                }
            }
        }
        Ok(opts)
    }
}
