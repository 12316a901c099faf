//! Verification of contract input signatures against the transaction being built.

use bitcoin::{
    ecdsa,
    hashes::Hash,
    secp256k1::{Message, PublicKey, XOnlyPublicKey, SECP256K1},
    sighash::SighashCache,
    taproot::{self, ControlBlock},
    CompressedPublicKey, Script, ScriptBuf, TapSighashType, Transaction, TxOut,
};
use utxord_taproot::signature_pubkeys;

use crate::{signer::taproot_sighash, witness::is_placeholder, ContractError};

/// Parses a witness Schnorr signature, rejecting a 65-byte form carrying the default type.
pub fn parse_taproot_signature(sig: &[u8]) -> Result<taproot::Signature, ContractError> {
    if sig.len() == 65 && sig[64] == TapSighashType::Default as u8 {
        return Err(ContractError::Signature(
            "explicit default sighash type is not allowed".into(),
        ));
    }
    taproot::Signature::from_slice(sig)
        .map_err(|e| ContractError::Signature(format!("malformed schnorr signature: {e}")))
}

/// Verifies `sig` by `pk` for input `nin`, by script path when `leaf` is given.
pub fn verify_taproot_signature(
    pk: &XOnlyPublicKey,
    sig: &[u8],
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
    leaf: Option<&Script>,
) -> Result<(), ContractError> {
    let sig = parse_taproot_signature(sig)?;
    let sighash = taproot_sighash(tx, nin, prevouts, leaf, sig.sighash_type)?;
    let msg = Message::from_digest(sighash.to_byte_array());
    SECP256K1
        .verify_schnorr(&sig.signature, &msg, pk)
        .map_err(|e| ContractError::Signature(format!("input {nin}: {e}")))
}

/// Fully verifies the witness of input `nin` against the output it spends.
///
/// Handles taproot key path, taproot script path (every key consumed by a checksig opcode
/// of the revealed leaf must have signed) and P2WPKH.
pub fn verify_input(tx: &Transaction, nin: usize, prevouts: &[TxOut]) -> Result<(), ContractError> {
    let input = tx
        .input
        .get(nin)
        .ok_or_else(|| ContractError::State(format!("no input {nin}")))?;
    let prevout = prevouts
        .get(nin)
        .ok_or_else(|| ContractError::State(format!("no prevout for input {nin}")))?;
    let items: Vec<&[u8]> = input.witness.iter().collect();
    let spk = &prevout.script_pubkey;

    if spk.is_p2tr() {
        let output_key = XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])
            .map_err(|e| ContractError::Signature(format!("input {nin} output key: {e}")))?;
        match items.as_slice() {
            [sig] => verify_taproot_signature(&output_key, sig, tx, nin, prevouts, None),
            [.., script, cb] => {
                let control_block = ControlBlock::decode(cb)
                    .map_err(|e| ContractError::Signature(format!("input {nin} control block: {e}")))?;
                let script = ScriptBuf::from_bytes(script.to_vec());
                if !control_block.verify_taproot_commitment(SECP256K1, output_key, &script) {
                    return Err(ContractError::Signature(format!(
                        "input {nin}: script is not committed by the output key"
                    )));
                }

                let keys = signature_pubkeys(&script);
                let sigs = &items[..items.len() - 2];
                if sigs.len() != keys.len() {
                    return Err(ContractError::Signature(format!(
                        "input {nin}: expected {} signatures, found {}",
                        keys.len(),
                        sigs.len()
                    )));
                }
                for (k, pk) in keys.iter().enumerate() {
                    let sig = sigs[sigs.len() - 1 - k];
                    if is_placeholder(sig) {
                        return Err(ContractError::Signature(format!(
                            "input {nin}: signature for {pk} is missing"
                        )));
                    }
                    verify_taproot_signature(pk, sig, tx, nin, prevouts, Some(&script))?;
                }
                Ok(())
            }
            [] => Err(ContractError::Signature(format!("input {nin}: empty witness"))),
        }
    } else if spk.is_p2wpkh() {
        let [sig, pk] = items.as_slice() else {
            return Err(ContractError::Signature(format!(
                "input {nin}: p2wpkh witness must have 2 items"
            )));
        };
        let sig = ecdsa::Signature::from_slice(sig)
            .map_err(|e| ContractError::Signature(format!("input {nin}: {e}")))?;
        let pk = PublicKey::from_slice(pk)
            .map_err(|e| ContractError::Signature(format!("input {nin} public key: {e}")))?;
        if ScriptBuf::new_p2wpkh(&CompressedPublicKey(pk).wpubkey_hash()) != *spk {
            return Err(ContractError::Signature(format!(
                "input {nin}: public key does not match the spent output"
            )));
        }
        let sighash = SighashCache::new(tx)
            .p2wpkh_signature_hash(nin, spk, prevout.value, sig.sighash_type)
            .map_err(|e| ContractError::Signature(format!("sighash for input {nin}: {e}")))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        SECP256K1
            .verify_ecdsa(&msg, &sig.signature, &pk)
            .map_err(|e| ContractError::Signature(format!("input {nin}: {e}")))
    } else {
        Err(ContractError::Signature(format!(
            "input {nin}: unsupported output script {}",
            spk.to_asm_string()
        )))
    }
}
