//! Deterministic fixtures shared by the utxord test suites.
//!
//! Every party of a contract gets a fixed key so that addresses, txids and signatures are
//! stable across runs. Addresses are always derived from these keys, never spelled out.

use std::sync::Once;

use bitcoin::{
    hashes::Hash,
    secp256k1::{Keypair, SecretKey, XOnlyPublicKey, SECP256K1},
    Address, Amount, CompressedPublicKey, Network, Txid,
};
use rand::RngCore;
use utxord_btc_types::{Destination, KeyCache, Utxo};
use utxord_common::logging::{self, LoggerConfig};

/// Network every fixture lives on.
pub const TEST_NETWORK: Network = Network::Regtest;

/// Roles a test key plays in a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKey {
    /// Buyer funding UTXOs.
    Funds,
    /// The ordinal being sold or the freshly created inscription.
    Ord,
    /// Seller UTXO paying the ordinal commit fee.
    OrdFunding,
    Change,
    Market,
    MarketFee,
    MarketScript,
    OrdScript,
    OrdInt,
    FundsScript,
    FundsPayoff,
    OrdPayoff,
    Inscribe,
    Author,
    Collection,
    CollectionScript,
    Custom,
}

impl TestKey {
    pub const ALL: &'static [TestKey] = &[
        TestKey::Funds,
        TestKey::Ord,
        TestKey::OrdFunding,
        TestKey::Change,
        TestKey::Market,
        TestKey::MarketFee,
        TestKey::MarketScript,
        TestKey::OrdScript,
        TestKey::OrdInt,
        TestKey::FundsScript,
        TestKey::FundsPayoff,
        TestKey::OrdPayoff,
        TestKey::Inscribe,
        TestKey::Author,
        TestKey::Collection,
        TestKey::CollectionScript,
        TestKey::Custom,
    ];

    /// Tag the key is stored under in [`test_key_cache`].
    pub fn tag(self) -> &'static str {
        match self {
            TestKey::Funds => "funds",
            TestKey::Ord => "ord",
            TestKey::OrdFunding => "ord_funding",
            TestKey::Change => "change",
            TestKey::Market => "market",
            TestKey::MarketFee => "market_fee",
            TestKey::MarketScript => "market_script",
            TestKey::OrdScript => "ord_script",
            TestKey::OrdInt => "ord_int",
            TestKey::FundsScript => "funds_script",
            TestKey::FundsPayoff => "funds_payoff",
            TestKey::OrdPayoff => "ord_payoff",
            TestKey::Inscribe => "inscribe",
            TestKey::Author => "author",
            TestKey::Collection => "collection",
            TestKey::CollectionScript => "collection_script",
            TestKey::Custom => "custom",
        }
    }

    pub fn secret(self) -> SecretKey {
        let index = TestKey::ALL.iter().position(|k| *k == self).unwrap_or_default();
        let byte = u8::try_from(index + 1).expect("few test keys");
        SecretKey::from_slice(&[byte; 32]).expect("small scalar is a valid key")
    }

    pub fn keypair(self) -> Keypair {
        Keypair::from_secret_key(SECP256K1, &self.secret())
    }

    pub fn xonly(self) -> XOnlyPublicKey {
        self.keypair().x_only_public_key().0
    }
}

/// BIP86 key-path address of `key`.
pub fn p2tr_address(key: TestKey) -> Address {
    Address::p2tr(SECP256K1, key.xonly(), None, TEST_NETWORK)
}

pub fn p2wpkh_address(key: TestKey) -> Address {
    Address::p2wpkh(&CompressedPublicKey(key.keypair().public_key()), TEST_NETWORK)
}

/// Key cache holding every [`TestKey`] under its tag.
pub fn test_key_cache() -> KeyCache {
    let mut cache = KeyCache::new(TEST_NETWORK);
    for key in TestKey::ALL {
        cache.add_key(key.tag(), key.keypair());
    }
    cache
}

/// Txid made of a repeated byte, standing in for a funding transaction that exists only in
/// the test.
pub fn fake_txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

pub fn random_txid() -> Txid {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Txid::from_byte_array(bytes)
}

/// UTXO of `amount` paying the BIP86 address of `key`.
pub fn fake_p2tr_utxo(byte: u8, nout: u32, amount: u64, key: TestKey) -> Utxo {
    let destination = Destination::p2tr_bip86(Amount::from_sat(amount), key.xonly(), TEST_NETWORK);
    Utxo::new(fake_txid(byte), nout, destination)
}

static INIT_LOGGING: Once = Once::new();

/// Installs the stdout logger once per test binary, at WARN unless `RUST_LOG` says otherwise.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let config = LoggerConfig::new("utxord-tests".to_owned()).with_filter(Some("warn".to_owned()));
        let _ = logging::try_init(config);
    });
}
