//! Inscription creation: a commit transaction funding a taproot output that commits to the
//! ordinal envelope, and a genesis transaction revealing it.
//!
//! A lazy inscription is co-signed by the market: the author signs the genesis with
//! `SIGHASH_SINGLE|ANYONECANPAY` and the market attaches the parent collection later.

mod builder;
mod script;

use std::{fmt, str::FromStr};

use bitcoin::{hashes::Hash, Txid};
use serde::{Deserialize, Serialize};
use utxord_btc_types::ContractError;

pub use builder::{CollectionRepr, InscriptionBuilder, InscriptionParams};
pub use script::{inscription_script, Envelope};

use crate::ContractPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InscriptionType {
    Inscription,
    /// Genesis co-signed by the market, which also owns the parent collection.
    LazyInscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InscriptionPhase {
    MarketTerms,
    LazyInscriptionMarketTerms,
    LazyInscriptionSignature,
    InscriptionSignature,
}

impl ContractPhase for InscriptionPhase {
    const ALL: &'static [Self] = &[
        InscriptionPhase::MarketTerms,
        InscriptionPhase::LazyInscriptionMarketTerms,
        InscriptionPhase::LazyInscriptionSignature,
        InscriptionPhase::InscriptionSignature,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            InscriptionPhase::MarketTerms => "MARKET_TERMS",
            InscriptionPhase::LazyInscriptionMarketTerms => "LAZY_INSCRIPTION_MARKET_TERMS",
            InscriptionPhase::LazyInscriptionSignature => "LAZY_INSCRIPTION_SIGNATURE",
            InscriptionPhase::InscriptionSignature => "INSCRIPTION_SIGNATURE",
        }
    }

    fn predecessors(self) -> &'static [Self] {
        match self {
            InscriptionPhase::MarketTerms => &[],
            InscriptionPhase::LazyInscriptionMarketTerms => &[InscriptionPhase::MarketTerms],
            InscriptionPhase::LazyInscriptionSignature => &[InscriptionPhase::LazyInscriptionMarketTerms],
            InscriptionPhase::InscriptionSignature => &[InscriptionPhase::LazyInscriptionSignature],
        }
    }
}

/// `<genesis txid>i<index>` identifier of an inscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InscriptionId {
    pub txid: Txid,
    pub index: u32,
}

impl InscriptionId {
    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Envelope encoding: txid in internal byte order followed by the little-endian index with
    /// trailing zero bytes dropped.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.txid.to_byte_array().to_vec();
        let index = self.index.to_le_bytes();
        let len = index.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
        bytes.extend_from_slice(&index[..len]);
        bytes
    }
}

impl FromStr for InscriptionId {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wrong = || ContractError::TermWrongValue(format!("inscription id: {s}"));
        let (txid, index) = s.split_once('i').ok_or_else(wrong)?;
        if txid.len() != 64 {
            return Err(wrong());
        }
        Ok(Self {
            txid: Txid::from_str(txid).map_err(|_| wrong())?,
            index: index.parse().map_err(|_| wrong())?,
        })
    }
}

impl fmt::Display for InscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}i{}", self.txid, self.index)
    }
}

/// Validates the textual form of an inscription id.
pub fn check_inscription_id(id: &str) -> Result<(), ContractError> {
    id.parse::<InscriptionId>().map(|_| ())
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const TXID: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn test_inscription_id_bytes() {
        let reversed = hex!("ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100");
        for index in [0u32, 1, 5] {
            let id: InscriptionId = format!("{TXID}i{index}").parse().expect("valid id");
            let mut expected = reversed.to_vec();
            if index > 0 {
                expected.push(u8::try_from(index).expect("small index"));
            }
            assert_eq!(id.to_bytes(), expected);
            assert_eq!(id.to_string(), format!("{TXID}i{index}"));
        }

        let id = InscriptionId::new(Txid::from_str(TXID).expect("txid"), 256);
        assert_eq!(&id.to_bytes()[32..], &[0, 1]);
    }

    #[test]
    fn test_malformed_ids_are_rejected() {
        assert!(check_inscription_id(&format!("{TXID}i0")).is_ok());
        for bad in [TXID.to_owned(), format!("{TXID}x0"), format!("{TXID}i"), format!("{}i0", &TXID[2..])] {
            assert!(check_inscription_id(&bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_phase_chain_is_linear() {
        assert!(InscriptionPhase::InscriptionSignature.reaches(InscriptionPhase::MarketTerms));
        assert!(!InscriptionPhase::MarketTerms.reaches(InscriptionPhase::LazyInscriptionMarketTerms));
        assert_eq!(
            InscriptionPhase::parse("LAZY_INSCRIPTION_SIGNATURE"),
            Ok(InscriptionPhase::LazyInscriptionSignature)
        );
    }
}
