//! Provably unspendable internal keys.
//!
//! `H + r·G`, where `H` is the BIP341 NUMS point with no known discrete logarithm and `r` is
//! a random factor. Disclosing `r` lets a counterparty check that the output can only be
//! spent through its script tree, while distinct factors keep such outputs unlinkable.

use bitcoin::key::Parity;
use hex_literal::hex;
use secp256k1::{PublicKey, Scalar, SecretKey, XOnlyPublicKey, SECP256K1};

/// X coordinate of the BIP341 NUMS point `H`.
pub const NUMS_POINT_X: [u8; 32] =
    hex!("50929b74c1a04954b78b4b6035e97a5e078a5a0f28ec96d547bfee9ace803ac0");

pub fn nums_point() -> Result<XOnlyPublicKey, secp256k1::Error> {
    XOnlyPublicKey::from_slice(&NUMS_POINT_X)
}

/// Derives the unspendable key `H + factor·G`.
pub fn unspendable_key(factor: &SecretKey) -> Result<XOnlyPublicKey, secp256k1::Error> {
    let nums = PublicKey::from_x_only_public_key(nums_point()?, Parity::Even);
    let key = nums.add_exp_tweak(SECP256K1, &Scalar::from(*factor))?;
    Ok(key.x_only_public_key().0)
}

/// Draws a fresh factor and returns it together with the derived key.
pub fn random_unspendable_key() -> Result<(XOnlyPublicKey, SecretKey), secp256k1::Error> {
    let factor = SecretKey::new(&mut rand::thread_rng());
    Ok((unspendable_key(&factor)?, factor))
}

/// Whether `key` is the unspendable key derived from `factor`.
pub fn verify_unspendable_key(key: &XOnlyPublicKey, factor: &SecretKey) -> bool {
    unspendable_key(factor).is_ok_and(|derived| derived == *key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nums_point_is_valid() {
        assert!(nums_point().is_ok(), "NUMS constant must be on the curve");
    }

    #[test]
    fn test_unspendable_key_is_deterministic() {
        let factor = SecretKey::from_slice(&[7; 32]).expect("valid factor");
        let first = unspendable_key(&factor).expect("derive key");
        let second = unspendable_key(&factor).expect("derive key");

        assert_eq!(first, second);
        assert_ne!(first, nums_point().expect("nums point"), "tweak must move the point");
        assert!(verify_unspendable_key(&first, &factor));
    }

    #[test]
    fn test_verify_rejects_other_factor() {
        let (key, _) = random_unspendable_key().expect("derive key");
        let other = SecretKey::from_slice(&[9; 32]).expect("valid factor");
        assert!(!verify_unspendable_key(&key, &other));
    }
}
