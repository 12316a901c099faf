//! Leaf scripts used by the contracts.

use bitcoin::{
    opcodes::all::{OP_CHECKSIG, OP_CHECKSIGADD, OP_CSV, OP_DROP, OP_NUMEQUAL},
    script::{Builder, Instruction},
    secp256k1::XOnlyPublicKey,
    Script, ScriptBuf,
};

/// `<pk1> OP_CHECKSIG <pk2> OP_CHECKSIGADD 2 OP_NUMEQUAL`
///
/// The witness satisfying it is `[sig2, sig1]`, the signature for the last key on top.
pub fn multisig_2of2(pk1: &XOnlyPublicKey, pk2: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(pk1)
        .push_opcode(OP_CHECKSIG)
        .push_x_only_key(pk2)
        .push_opcode(OP_CHECKSIGADD)
        .push_int(2)
        .push_opcode(OP_NUMEQUAL)
        .into_script()
}

/// `<blocks> OP_CHECKSEQUENCEVERIFY OP_DROP <pk> OP_CHECKSIG`
pub fn csv_timelock(blocks: u16, pk: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_int(i64::from(blocks))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_x_only_key(pk)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Keys checked by a leaf script, in script order.
///
/// A key counts when its 32-byte push is immediately consumed by `OP_CHECKSIG` or
/// `OP_CHECKSIGADD`. Witness signatures line up in reverse: the signature for the key at
/// position `k` of `n` sits at witness index `n - 1 - k`.
pub fn signature_pubkeys(script: &Script) -> Vec<XOnlyPublicKey> {
    let mut keys = Vec::new();
    let mut last_push: Option<&[u8]> = None;

    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => last_push = Some(bytes.as_bytes()),
            Ok(Instruction::Op(op)) => {
                if op == OP_CHECKSIG || op == OP_CHECKSIGADD {
                    if let Some(pk) = last_push.and_then(|b| XOnlyPublicKey::from_slice(b).ok()) {
                        keys.push(pk);
                    }
                }
                last_push = None;
            }
            Err(_) => break,
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{Keypair, SECP256K1};

    use super::*;

    fn key(byte: u8) -> XOnlyPublicKey {
        Keypair::from_seckey_slice(SECP256K1, &[byte; 32])
            .expect("valid secret key")
            .x_only_public_key()
            .0
    }

    #[test]
    fn test_multisig_layout() {
        let (a, b) = (key(1), key(2));
        let script = multisig_2of2(&a, &b);

        assert_eq!(script.len(), 70, "two key pushes and four opcodes");
        let bytes = script.as_bytes();
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[1..33], &a.serialize()[..]);
        assert_eq!(bytes[33], OP_CHECKSIG.to_u8());
        assert_eq!(&bytes[35..67], &b.serialize()[..]);
        assert_eq!(bytes[67], OP_CHECKSIGADD.to_u8());
        assert_eq!(bytes[69], OP_NUMEQUAL.to_u8());
    }

    #[test]
    fn test_csv_layout() {
        let script = csv_timelock(12, &key(3));
        assert_eq!(script.len(), 37);
        // small ints encode as OP_N
        assert_eq!(script.as_bytes()[0], 0x5c);
        assert_eq!(script.as_bytes()[1], OP_CSV.to_u8());
    }

    #[test]
    fn test_signature_pubkeys_order() {
        let (a, b) = (key(4), key(5));
        assert_eq!(signature_pubkeys(&multisig_2of2(&a, &b)), vec![a, b]);
        assert_eq!(signature_pubkeys(&csv_timelock(12, &b)), vec![b]);
        assert!(signature_pubkeys(&ScriptBuf::new()).is_empty());
    }
}
