//! Signature hashes and signing of contract inputs.

use bitcoin::{
    ecdsa,
    hashes::Hash,
    key::TapTweak,
    secp256k1::{Keypair, Message, SECP256K1},
    sighash::{Prevouts, SighashCache},
    taproot::{self, LeafVersion, TapLeafHash},
    EcdsaSighashType, Script, TapSighash, TapSighashType, Transaction, TxOut, Witness,
};

use crate::{ContractError, Destination, KeyRegistry, SigningKey, WitnessStack};

fn prevouts_for(
    prevouts: &[TxOut],
    nin: usize,
    sighash_type: TapSighashType,
) -> Result<Prevouts<'_, TxOut>, ContractError> {
    let anyone_can_pay = matches!(
        sighash_type,
        TapSighashType::AllPlusAnyoneCanPay
            | TapSighashType::NonePlusAnyoneCanPay
            | TapSighashType::SinglePlusAnyoneCanPay
    );
    if anyone_can_pay {
        let prevout = prevouts
            .get(nin)
            .ok_or_else(|| ContractError::State(format!("no prevout for input {nin}")))?;
        Ok(Prevouts::One(nin, prevout.clone()))
    } else {
        Ok(Prevouts::All(prevouts))
    }
}

/// Taproot sighash for input `nin`, by script path when `leaf` is given.
pub fn taproot_sighash(
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
    leaf: Option<&Script>,
    sighash_type: TapSighashType,
) -> Result<TapSighash, ContractError> {
    let prevouts = prevouts_for(prevouts, nin, sighash_type)?;
    let mut cache = SighashCache::new(tx);
    match leaf {
        Some(script) => cache.taproot_script_spend_signature_hash(
            nin,
            &prevouts,
            TapLeafHash::from_script(script, LeafVersion::TapScript),
            sighash_type,
        ),
        None => cache.taproot_key_spend_signature_hash(nin, &prevouts, sighash_type),
    }
    .map_err(|e| ContractError::Signature(format!("sighash for input {nin}: {e}")))
}

/// Schnorr signature serialized for the witness: 64 bytes for the default sighash type,
/// 65 with the type byte appended otherwise.
pub fn sign_taproot(
    keypair: &Keypair,
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
    leaf: Option<&Script>,
    sighash_type: TapSighashType,
) -> Result<Vec<u8>, ContractError> {
    let sighash = taproot_sighash(tx, nin, prevouts, leaf, sighash_type)?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = SECP256K1.sign_schnorr_no_aux_rand(&msg, keypair);
    Ok(taproot::Signature {
        signature,
        sighash_type,
    }
    .to_vec())
}

/// Signs a P2WPKH input with `SIGHASH_ALL`, returning the complete witness.
pub fn sign_p2wpkh(
    keypair: &Keypair,
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
) -> Result<WitnessStack, ContractError> {
    let prevout = prevouts
        .get(nin)
        .ok_or_else(|| ContractError::State(format!("no prevout for input {nin}")))?;
    let sighash = SighashCache::new(tx)
        .p2wpkh_signature_hash(nin, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
        .map_err(|e| ContractError::Signature(format!("sighash for input {nin}: {e}")))?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = ecdsa::Signature {
        signature: SECP256K1.sign_ecdsa_low_r(&msg, &keypair.secret_key()),
        sighash_type: EcdsaSighashType::All,
    };
    Ok(Witness::p2wpkh(&signature, &keypair.public_key()).into())
}

/// Signs input `nin` with `key` by key path or P2WPKH, as the key kind dictates.
pub fn sign_with_key(
    key: &SigningKey,
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
    sighash_type: TapSighashType,
) -> Result<WitnessStack, ContractError> {
    match key {
        SigningKey::TaprootBip86(kp) => {
            let tweaked = kp.tap_tweak(SECP256K1, None).to_inner();
            let sig = sign_taproot(&tweaked, tx, nin, prevouts, None, sighash_type)?;
            Ok(WitnessStack::from_items(vec![sig]))
        }
        SigningKey::Taproot(kp) => {
            let sig = sign_taproot(kp, tx, nin, prevouts, None, sighash_type)?;
            Ok(WitnessStack::from_items(vec![sig]))
        }
        SigningKey::Ecdsa(kp) => sign_p2wpkh(kp, tx, nin, prevouts),
    }
}

/// Looks up the key controlling `destination` and signs input `nin` spending it.
pub fn sign_destination(
    registry: &dyn KeyRegistry,
    filter: &str,
    destination: &Destination,
    tx: &Transaction,
    nin: usize,
    prevouts: &[TxOut],
    sighash_type: TapSighashType,
) -> Result<WitnessStack, ContractError> {
    let address = match destination {
        Destination::P2tr { address, .. } | Destination::P2wpkh { address, .. } => address,
        other => {
            return Err(ContractError::State(format!(
                "input {nin} spends an output that cannot be signed here: {:?}",
                other.to_repr()
            )))
        }
    };
    let key = registry.lookup(&address.to_string(), filter)?;
    if matches!(destination, Destination::P2wpkh { .. }) != matches!(key, SigningKey::Ecdsa(_)) {
        return Err(ContractError::Key(format!("key kind does not match {address}")));
    }
    sign_with_key(&key, tx, nin, prevouts, sighash_type)
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        absolute::LockTime, transaction::Version, Address, Amount, CompressedPublicKey, Network,
        OutPoint, ScriptBuf, Sequence, TxIn, Txid,
    };

    use super::*;
    use crate::{verify_input, KeyCache};

    fn spending_tx(prev: &TxOut) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: prev.value - Amount::from_sat(200),
                script_pubkey: prev.script_pubkey.clone(),
            }],
        }
    }

    #[test]
    fn test_bip86_key_spend_verifies() {
        let kp = Keypair::from_seckey_slice(SECP256K1, &[3; 32]).expect("valid key");
        let mut cache = KeyCache::new(Network::Regtest);
        cache.add_key("", kp);

        let dest = Destination::p2tr_bip86(Amount::from_sat(10_000), kp.x_only_public_key().0, Network::Regtest);
        let prevouts = vec![dest.required_tx_out().expect("p2tr output")];
        let mut tx = spending_tx(&prevouts[0]);

        let witness = sign_destination(&cache, "", &dest, &tx, 0, &prevouts, TapSighashType::Default)
            .expect("sign");
        assert_eq!(witness.get(0).map(<[u8]>::len), Some(64), "default sighash has no type byte");

        tx.input[0].witness = witness.to_witness();
        verify_input(&tx, 0, &prevouts).expect("signature verifies");
    }

    #[test]
    fn test_p2wpkh_spend_verifies() {
        let kp = Keypair::from_seckey_slice(SECP256K1, &[4; 32]).expect("valid key");
        let mut cache = KeyCache::new(Network::Regtest);
        cache.add_key("funds", kp);

        let addr = Address::p2wpkh(&CompressedPublicKey(kp.public_key()), Network::Regtest);
        let dest = Destination::from_address(Amount::from_sat(10_000), addr).expect("p2wpkh");
        let prevouts = vec![dest.required_tx_out().expect("p2wpkh output")];
        let mut tx = spending_tx(&prevouts[0]);

        let witness = sign_destination(&cache, "funds", &dest, &tx, 0, &prevouts, TapSighashType::All)
            .expect("sign");
        assert_eq!(witness.len(), 2);
        assert!(witness.get(0).map(<[u8]>::len) <= Some(71), "low-R signature");

        tx.input[0].witness = witness.to_witness();
        verify_input(&tx, 0, &prevouts).expect("signature verifies");
    }

    #[test]
    fn test_anyone_can_pay_signature_has_type_byte() {
        let kp = Keypair::from_seckey_slice(SECP256K1, &[5; 32]).expect("valid key");
        let dest = Destination::p2tr_raw(Amount::from_sat(546), kp.x_only_public_key().0, Network::Regtest);
        let prevouts = vec![dest.required_tx_out().expect("p2tr output")];
        let tx = spending_tx(&prevouts[0]);

        let sig = sign_taproot(&kp, &tx, 0, &prevouts, None, TapSighashType::SinglePlusAnyoneCanPay)
            .expect("sign");
        assert_eq!(sig.len(), 65);
        assert_eq!(sig[64], TapSighashType::SinglePlusAnyoneCanPay as u8);
    }
}
