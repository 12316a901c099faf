//! BIP322 "simple" message signatures for P2WPKH and P2TR key-path addresses.
//!
//! A message is committed to by a virtual `to_spend` transaction paying the signing address,
//! and the signature is the witness of the virtual `to_sign` transaction spending it,
//! serialized the way a witness is serialized on the wire.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::{
    absolute::LockTime,
    consensus,
    opcodes::{all::OP_RETURN, OP_0},
    script::Builder,
    transaction::Version,
    Address, AddressType, Amount, Network, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use utxord_btc_types::{parse_address, sign_destination, verify_input, Destination, ErrorKind, KeyRegistry};

mod errors;

pub use errors::Bip322Error;

const MESSAGE_TAG: &[u8] = b"BIP0322-signed-message";

/// Tagged hash of `message`.
pub fn hash(message: &[u8]) -> [u8; 32] {
    let tag = Sha256::digest(MESSAGE_TAG);
    Sha256::new()
        .chain_update(tag)
        .chain_update(tag)
        .chain_update(message)
        .finalize()
        .into()
}

/// Virtual transaction committing to `message` and paying nothing to `address`.
pub fn to_spend(address: &Address, message: &[u8]) -> Transaction {
    let script_sig = Builder::new().push_opcode(OP_0).push_slice(hash(message)).into_script();
    Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: address.script_pubkey(),
        }],
    }
}

/// Virtual transaction spending output 0 of the `to_spend` transaction `to_spend_txid`.
pub fn to_sign(to_spend_txid: Txid) -> Transaction {
    Transaction {
        version: Version(0),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(to_spend_txid, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: Builder::new().push_opcode(OP_RETURN).into_script(),
        }],
    }
}

/// Signs and verifies messages for addresses of one network.
#[derive(Debug, Clone, Copy)]
pub struct Bip322 {
    network: Network,
}

impl Bip322 {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn signing_address(&self, address: &str) -> Result<Address, Bip322Error> {
        let address = parse_address(address, self.network)?;
        match address.address_type() {
            Some(AddressType::P2wpkh | AddressType::P2tr) => Ok(address),
            _ => Err(Bip322Error::UnsupportedAddress(address.to_string())),
        }
    }

    fn virtual_spend(address: &Address, message: &[u8]) -> (Transaction, Vec<TxOut>) {
        let to_spend = to_spend(address, message);
        let tx = to_sign(to_spend.compute_txid());
        (tx, to_spend.output)
    }

    /// Signs `message` with the key `registry` holds for `address`, returning the serialized
    /// witness.
    pub fn sign(
        &self,
        registry: &dyn KeyRegistry,
        filter: &str,
        address: &str,
        message: &[u8],
    ) -> Result<Vec<u8>, Bip322Error> {
        let address = self.signing_address(address)?;
        let (tx, prevouts) = Self::virtual_spend(&address, message);
        let destination = Destination::from_address(Amount::ZERO, address)?;

        let witness = sign_destination(registry, filter, &destination, &tx, 0, &prevouts, TapSighashType::Default)?;
        info!(address = ?destination.address(), "message signed");
        Ok(consensus::serialize(&witness.to_witness()))
    }

    /// Checks `signature` of `message` by `address`.
    ///
    /// A signature that does not verify yields `Ok(false)`, a malformed address or witness
    /// encoding is an error.
    pub fn verify(&self, signature: &[u8], address: &str, message: &[u8]) -> Result<bool, Bip322Error> {
        let address = self.signing_address(address)?;
        let witness: Witness = consensus::deserialize(signature)?;
        let (mut tx, prevouts) = Self::virtual_spend(&address, message);
        tx.input[0].witness = witness;

        match verify_input(&tx, 0, &prevouts) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::Signature => {
                debug!(%address, error = %e, "message signature rejected");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn sign_base64(
        &self,
        registry: &dyn KeyRegistry,
        filter: &str,
        address: &str,
        message: &[u8],
    ) -> Result<String, Bip322Error> {
        Ok(STANDARD.encode(self.sign(registry, filter, address, message)?))
    }

    pub fn verify_base64(&self, signature: &str, address: &str, message: &[u8]) -> Result<bool, Bip322Error> {
        let signature = STANDARD.decode(signature)?;
        self.verify(&signature, address, message)
    }
}
