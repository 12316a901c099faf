//! Spendable outputs a contract can pay to or spend from.

use bitcoin::{
    address::NetworkUnchecked,
    key::TweakedPublicKey,
    script::PushBytesBuf,
    secp256k1::{XOnlyPublicKey, SECP256K1},
    Address, AddressType, Amount, Network, ScriptBuf, TxOut,
};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::{
    fee::{dust_floor, DUST_RELAY_FEE},
    ContractError, WitnessStack,
};

/// Size of a low-R DER signature with its sighash byte.
pub const P2WPKH_DUMMY_SIG_LEN: usize = 71;

/// Closed set of output kinds understood by the contracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    P2wpkh { amount: Amount, address: Address },
    P2tr { amount: Amount, address: Address },
    P2pkh { amount: Amount, address: Address },
    OpReturn { amount: Amount, data: PushBytesBuf },
    RuneStone { amount: Amount, script: ScriptBuf },
    /// No output at all, e.g. a market fee that is not charged.
    Zero,
}

pub fn parse_address(addr: &str, network: Network) -> Result<Address, ContractError> {
    addr.parse::<Address<NetworkUnchecked>>()
        .map_err(|e| ContractError::TermWrongValue(format!("address {addr}: {e}")))?
        .require_network(network)
        .map_err(|e| ContractError::TermWrongValue(format!("address {addr}: {e}")))
}

impl Destination {
    pub fn from_address(amount: Amount, address: Address) -> Result<Self, ContractError> {
        match address.address_type() {
            Some(AddressType::P2wpkh) => Ok(Destination::P2wpkh { amount, address }),
            Some(AddressType::P2tr) => Ok(Destination::P2tr { amount, address }),
            Some(AddressType::P2pkh) => Ok(Destination::P2pkh { amount, address }),
            other => Err(ContractError::TermWrongValue(format!(
                "unsupported address type {other:?}: {address}"
            ))),
        }
    }

    pub fn from_addr_str(amount: Amount, addr: &str, network: Network) -> Result<Self, ContractError> {
        Self::from_address(amount, parse_address(addr, network)?)
    }

    /// Taproot output whose output key is `key` itself, with no tweak applied.
    pub fn p2tr_raw(amount: Amount, key: XOnlyPublicKey, network: Network) -> Self {
        let output_key = TweakedPublicKey::dangerous_assume_tweaked(key);
        Destination::P2tr {
            amount,
            address: Address::p2tr_tweaked(output_key, network),
        }
    }

    /// Key-path only taproot output of `internal_key`.
    pub fn p2tr_bip86(amount: Amount, internal_key: XOnlyPublicKey, network: Network) -> Self {
        Destination::P2tr {
            amount,
            address: Address::p2tr(SECP256K1, internal_key, None, network),
        }
    }

    pub fn op_return(amount: Amount, data: Vec<u8>) -> Result<Self, ContractError> {
        let data = PushBytesBuf::try_from(data)
            .map_err(|_| ContractError::TermWrongValue("op_return data too long".into()))?;
        Ok(Destination::OpReturn { amount, data })
    }

    pub fn amount(&self) -> Amount {
        match self {
            Destination::P2wpkh { amount, .. }
            | Destination::P2tr { amount, .. }
            | Destination::P2pkh { amount, .. }
            | Destination::OpReturn { amount, .. }
            | Destination::RuneStone { amount, .. } => *amount,
            Destination::Zero => Amount::ZERO,
        }
    }

    pub fn set_amount(&mut self, value: Amount) -> Result<(), ContractError> {
        match self {
            Destination::P2wpkh { amount, .. }
            | Destination::P2tr { amount, .. }
            | Destination::P2pkh { amount, .. }
            | Destination::OpReturn { amount, .. }
            | Destination::RuneStone { amount, .. } => {
                *amount = value;
                Ok(())
            }
            Destination::Zero if value == Amount::ZERO => Ok(()),
            Destination::Zero => Err(ContractError::TermWrongValue(format!(
                "zero destination cannot carry {value}"
            ))),
        }
    }

    pub fn address(&self) -> Option<&Address> {
        match self {
            Destination::P2wpkh { address, .. }
            | Destination::P2tr { address, .. }
            | Destination::P2pkh { address, .. } => Some(address),
            _ => None,
        }
    }

    /// Legacy address destination, gated by protocol version in the contracts.
    pub fn is_p2address(&self) -> bool {
        matches!(self, Destination::P2pkh { .. })
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Destination::Zero)
    }

    pub fn script_pubkey(&self) -> Option<ScriptBuf> {
        match self {
            Destination::P2wpkh { address, .. }
            | Destination::P2tr { address, .. }
            | Destination::P2pkh { address, .. } => Some(address.script_pubkey()),
            Destination::OpReturn { data, .. } => Some(ScriptBuf::new_op_return(data)),
            Destination::RuneStone { script, .. } => Some(script.clone()),
            Destination::Zero => None,
        }
    }

    pub fn tx_out(&self) -> Option<TxOut> {
        self.script_pubkey().map(|script_pubkey| TxOut {
            value: self.amount(),
            script_pubkey,
        })
    }

    /// Output that must exist, failing for [`Destination::Zero`].
    pub fn required_tx_out(&self) -> Result<TxOut, ContractError> {
        self.tx_out()
            .ok_or_else(|| ContractError::State("zero destination has no output".into()))
    }

    /// Whether the amount is below the dust floor of the output script at the default relay fee.
    pub fn is_dust(&self) -> bool {
        self.is_dust_at(DUST_RELAY_FEE)
    }

    pub fn is_dust_at(&self, dust_relay_fee: Amount) -> bool {
        match self {
            Destination::OpReturn { .. } | Destination::Zero => false,
            _ => self
                .script_pubkey()
                .is_some_and(|script| self.amount() < dust_floor(&script, dust_relay_fee)),
        }
    }

    pub fn check_dust(&self, name: &str) -> Result<(), ContractError> {
        self.check_dust_at(name, DUST_RELAY_FEE)
    }

    pub fn check_dust_at(&self, name: &str, dust_relay_fee: Amount) -> Result<(), ContractError> {
        if self.is_dust_at(dust_relay_fee) {
            return Err(ContractError::Dust(format!("{name}: {}", self.amount())));
        }
        Ok(())
    }

    /// Placeholder witness of the size a real key-path or P2WPKH spend has.
    pub fn dummy_witness(&self) -> Result<WitnessStack, ContractError> {
        match self {
            Destination::P2wpkh { .. } => Ok(WitnessStack::from_items(vec![
                vec![0; P2WPKH_DUMMY_SIG_LEN],
                vec![0; 33],
            ])),
            Destination::P2tr { .. } => Ok(WitnessStack::from_items(vec![vec![0; 64]])),
            other => Err(ContractError::State(format!(
                "no witness template for {}",
                other.type_name()
            ))),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Destination::P2wpkh { .. } => "p2wpkh",
            Destination::P2tr { .. } => "p2tr",
            Destination::P2pkh { .. } => "p2pkh",
            Destination::OpReturn { .. } => "opreturn",
            Destination::RuneStone { .. } => "runestone",
            Destination::Zero => "zero",
        }
    }

    pub fn to_repr(&self) -> DestinationRepr {
        match self {
            Destination::P2wpkh { amount, address } | Destination::P2tr { amount, address } => {
                DestinationRepr::P2witness {
                    amount: *amount,
                    addr: address.to_string(),
                }
            }
            Destination::P2pkh { amount, address } => DestinationRepr::P2address {
                amount: *amount,
                addr: address.to_string(),
            },
            Destination::OpReturn { amount, data } => DestinationRepr::Opreturn {
                amount: *amount,
                data: data.as_bytes().to_vec(),
            },
            Destination::RuneStone { amount, script } => DestinationRepr::Runestone {
                amount: *amount,
                script: script.to_bytes(),
            },
            Destination::Zero => DestinationRepr::Zero,
        }
    }

    pub fn from_repr(repr: DestinationRepr, network: Network) -> Result<Self, ContractError> {
        match repr {
            DestinationRepr::P2witness { amount, addr } => {
                let dest = Self::from_addr_str(amount, &addr, network)?;
                if dest.is_p2address() {
                    return Err(ContractError::TermWrongValue(format!(
                        "not a witness address: {addr}"
                    )));
                }
                Ok(dest)
            }
            DestinationRepr::P2address { amount, addr } => Self::from_addr_str(amount, &addr, network),
            DestinationRepr::Opreturn { amount, data } => Self::op_return(amount, data),
            DestinationRepr::Runestone { amount, script } => Ok(Destination::RuneStone {
                amount,
                script: ScriptBuf::from_bytes(script),
            }),
            DestinationRepr::Zero => Ok(Destination::Zero),
        }
    }
}

/// JSON shape of a [`Destination`], dispatched on its `type` tag.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationRepr {
    P2witness {
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        amount: Amount,
        addr: String,
    },
    P2address {
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        amount: Amount,
        addr: String,
    },
    Opreturn {
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        amount: Amount,
        #[serde_as(as = "Hex")]
        data: Vec<u8>,
    },
    Runestone {
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        amount: Amount,
        #[serde_as(as = "Hex")]
        script: Vec<u8>,
    },
    Zero,
}

#[cfg(test)]
mod tests {
    use bitcoin::{secp256k1::Keypair, CompressedPublicKey};

    use super::*;

    fn keypair(byte: u8) -> Keypair {
        Keypair::from_seckey_slice(SECP256K1, &[byte; 32]).expect("valid secret key")
    }

    #[test]
    fn test_witness_json_shape() {
        let dest = Destination::p2tr_bip86(
            Amount::from_sat(546),
            keypair(1).x_only_public_key().0,
            Network::Regtest,
        );
        let json = serde_json::to_value(dest.to_repr()).expect("serialize");
        assert_eq!(json["type"], "p2witness");
        assert_eq!(json["amount"], 546);

        let back = Destination::from_repr(
            serde_json::from_value(json).expect("deserialize"),
            Network::Regtest,
        )
        .expect("valid destination");
        assert_eq!(back, dest);
    }

    #[test]
    fn test_zero_destination() {
        let json = serde_json::to_string(&Destination::Zero.to_repr()).expect("serialize");
        assert_eq!(json, r#"{"type":"zero"}"#);

        let mut zero = Destination::Zero;
        assert!(zero.tx_out().is_none());
        assert!(zero.set_amount(Amount::ZERO).is_ok());
        assert!(zero.set_amount(Amount::from_sat(1)).is_err());
    }

    #[test]
    fn test_wrong_network_rejected() {
        let addr = Address::p2wpkh(&CompressedPublicKey(keypair(2).public_key()), Network::Bitcoin);
        let err = Destination::from_addr_str(Amount::ONE_SAT, &addr.to_string(), Network::Regtest)
            .expect_err("mainnet address on regtest");
        assert_eq!(err.kind(), crate::ErrorKind::TermWrongValue);
    }

    #[test]
    fn test_p2address_is_not_witness() {
        let pk = CompressedPublicKey(keypair(3).public_key());
        let addr = Address::p2pkh(pk.pubkey_hash(), Network::Regtest);
        let repr = DestinationRepr::P2witness {
            amount: Amount::from_sat(1000),
            addr: addr.to_string(),
        };
        assert!(Destination::from_repr(repr, Network::Regtest).is_err());

        let dest = Destination::from_address(Amount::from_sat(1000), addr).expect("p2pkh");
        assert!(dest.is_p2address());
        assert!(matches!(dest.to_repr(), DestinationRepr::P2address { .. }));
        assert!(dest.dummy_witness().is_err(), "legacy inputs have no witness");
    }

    #[test]
    fn test_dust_floor_depends_on_script() {
        let pk = keypair(4);
        let p2wpkh = Destination::from_address(
            Amount::from_sat(294),
            Address::p2wpkh(&CompressedPublicKey(pk.public_key()), Network::Regtest),
        )
        .expect("p2wpkh");
        assert!(!p2wpkh.is_dust());

        let p2tr = Destination::p2tr_bip86(Amount::from_sat(329), pk.x_only_public_key().0, Network::Regtest);
        assert!(p2tr.is_dust());
        assert!(p2tr.check_dust("change").is_err());
    }

    #[test]
    fn test_dust_floor_follows_relay_fee() {
        let xonly = keypair(4).x_only_public_key().0;
        let p2tr = Destination::p2tr_bip86(Amount::from_sat(330), xonly, Network::Regtest);
        assert!(!p2tr.is_dust());
        assert!(p2tr.is_dust_at(Amount::from_sat(6000)));
        assert_eq!(
            p2tr.check_dust_at("ord", Amount::from_sat(6000)).map_err(|e| e.kind()),
            Err(crate::ErrorKind::Dust)
        );

        let p2tr = Destination::p2tr_bip86(Amount::from_sat(110), xonly, Network::Regtest);
        assert!(p2tr.is_dust());
        assert!(!p2tr.is_dust_at(Amount::from_sat(1000)));
    }

    #[test]
    fn test_op_return_script() {
        let dest = Destination::op_return(Amount::ZERO, b"utxord".to_vec()).expect("short data");
        let script = dest.script_pubkey().expect("op_return has a script");
        assert!(script.is_op_return());
        assert!(!dest.is_dust());
    }
}
