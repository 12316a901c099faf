//! Resolution of signing keys from the addresses and public keys named in a contract.

use std::{collections::BTreeMap, str::FromStr};

use bitcoin::{
    key::TweakedPublicKey,
    secp256k1::{Keypair, SecretKey, XOnlyPublicKey, SECP256K1},
    Address, AddressType, CompressedPublicKey, Network,
};

use crate::{destination::parse_address, ContractError};

/// Key material resolved for an identifier, tagged with how it has to sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKey {
    /// Internal key of a BIP86 output, signs by key path after the taproot tweak.
    TaprootBip86(Keypair),
    /// Untweaked x-only key, used for script paths and raw `OP_1 <pk>` outputs.
    Taproot(Keypair),
    /// Key of a P2WPKH or P2PKH output.
    Ecdsa(Keypair),
}

impl SigningKey {
    pub fn keypair(&self) -> &Keypair {
        match self {
            SigningKey::TaprootBip86(kp) | SigningKey::Taproot(kp) | SigningKey::Ecdsa(kp) => kp,
        }
    }

    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair().x_only_public_key().0
    }
}

/// Source of signing keys.
///
/// `identifier` is a hex x-only public key or an address; `filter` narrows the search to a
/// group of keys, an empty filter searching everything.
pub trait KeyRegistry {
    fn lookup(&self, identifier: &str, filter: &str) -> Result<SigningKey, ContractError>;
}

/// In-memory [`KeyRegistry`] holding keys grouped by tag.
#[derive(Debug, Clone)]
pub struct KeyCache {
    network: Network,
    keys: BTreeMap<String, Vec<Keypair>>,
}

enum Identifier {
    XOnly(XOnlyPublicKey),
    Address(Address),
}

impl KeyCache {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            keys: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn add_key(&mut self, tag: impl Into<String>, keypair: Keypair) {
        self.keys.entry(tag.into()).or_default().push(keypair);
    }

    pub fn add_secret(&mut self, tag: impl Into<String>, secret: &SecretKey) {
        self.add_key(tag, Keypair::from_secret_key(SECP256K1, secret));
    }

    fn parse_identifier(&self, identifier: &str) -> Result<Identifier, ContractError> {
        if identifier.len() == 64 {
            if let Ok(pk) = XOnlyPublicKey::from_str(identifier) {
                return Ok(Identifier::XOnly(pk));
            }
        }
        parse_address(identifier, self.network)
            .map(Identifier::Address)
            .map_err(|e| ContractError::Key(format!("unrecognized key identifier: {identifier}")).caused_by(e))
    }

    fn match_key(&self, keypair: &Keypair, identifier: &Identifier) -> Option<SigningKey> {
        let xonly = keypair.x_only_public_key().0;
        match identifier {
            Identifier::XOnly(pk) => (*pk == xonly).then_some(SigningKey::Taproot(*keypair)),
            Identifier::Address(addr) => match addr.address_type()? {
                AddressType::P2tr => {
                    if *addr == Address::p2tr(SECP256K1, xonly, None, self.network) {
                        Some(SigningKey::TaprootBip86(*keypair))
                    } else if *addr
                        == Address::p2tr_tweaked(
                            TweakedPublicKey::dangerous_assume_tweaked(xonly),
                            self.network,
                        )
                    {
                        Some(SigningKey::Taproot(*keypair))
                    } else {
                        None
                    }
                }
                AddressType::P2wpkh => {
                    let pk = CompressedPublicKey(keypair.public_key());
                    (*addr == Address::p2wpkh(&pk, self.network)).then_some(SigningKey::Ecdsa(*keypair))
                }
                AddressType::P2pkh => {
                    let pk = CompressedPublicKey(keypair.public_key());
                    (*addr == Address::p2pkh(pk.pubkey_hash(), self.network))
                        .then_some(SigningKey::Ecdsa(*keypair))
                }
                _ => None,
            },
        }
    }
}

impl KeyRegistry for KeyCache {
    fn lookup(&self, identifier: &str, filter: &str) -> Result<SigningKey, ContractError> {
        let parsed = self.parse_identifier(identifier)?;
        self.keys
            .iter()
            .filter(|(tag, _)| filter.is_empty() || tag.as_str() == filter)
            .flat_map(|(_, keys)| keys.iter())
            .find_map(|kp| self.match_key(kp, &parsed))
            .ok_or_else(|| ContractError::Key(format!("no key for {identifier}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (KeyCache, Keypair, Keypair) {
        let taproot = Keypair::from_seckey_slice(SECP256K1, &[1; 32]).expect("valid key");
        let segwit = Keypair::from_seckey_slice(SECP256K1, &[2; 32]).expect("valid key");
        let mut cache = KeyCache::new(Network::Regtest);
        cache.add_key("ord", taproot);
        cache.add_key("funds", segwit);
        (cache, taproot, segwit)
    }

    #[test]
    fn test_lookup_by_xonly_hex() {
        let (cache, taproot, _) = cache();
        let pk = taproot.x_only_public_key().0.to_string();
        assert_eq!(cache.lookup(&pk, ""), Ok(SigningKey::Taproot(taproot)));
    }

    #[test]
    fn test_lookup_by_addresses() {
        let (cache, taproot, segwit) = cache();
        let xonly = taproot.x_only_public_key().0;

        let bip86 = Address::p2tr(SECP256K1, xonly, None, Network::Regtest).to_string();
        assert_eq!(cache.lookup(&bip86, "ord"), Ok(SigningKey::TaprootBip86(taproot)));

        let raw = Address::p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly), Network::Regtest)
            .to_string();
        assert_eq!(cache.lookup(&raw, ""), Ok(SigningKey::Taproot(taproot)));

        let p2wpkh = Address::p2wpkh(&CompressedPublicKey(segwit.public_key()), Network::Regtest).to_string();
        assert_eq!(cache.lookup(&p2wpkh, ""), Ok(SigningKey::Ecdsa(segwit)));
    }

    #[test]
    fn test_filter_limits_search() {
        let (cache, taproot, _) = cache();
        let pk = taproot.x_only_public_key().0.to_string();
        let err = cache.lookup(&pk, "funds").expect_err("key is tagged ord");
        assert_eq!(err.kind(), crate::ErrorKind::Key);
    }

    #[test]
    fn test_garbage_identifier() {
        let (cache, ..) = cache();
        let err = cache.lookup("not-a-key", "").expect_err("garbage identifier");
        assert_eq!(err.kind(), crate::ErrorKind::Key);
    }
}
