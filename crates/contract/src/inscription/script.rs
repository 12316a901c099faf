//! Ordinal envelope leaf script.

use bitcoin::{
    opcodes::{
        all::{OP_ENDIF, OP_IF},
        OP_FALSE,
    },
    script::{Builder, PushBytes},
    Script, ScriptBuf,
};
use utxord_btc_types::ContractError;

use super::InscriptionId;

const ORD_TAG: &[u8] = b"ord";
const CONTENT_TYPE_TAG: &[u8] = &[1];
const PARENT_TAG: &[u8] = &[3];
const METADATA_TAG: &[u8] = &[5];
const DELEGATE_TAG: &[u8] = &[11];

/// Largest data push a tapscript accepts.
const MAX_PUSH: usize = 520;

/// Fields an inscription reveals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub content_type: Option<String>,
    pub content: Option<Vec<u8>>,
    /// CBOR encoded.
    pub metadata: Option<Vec<u8>>,
    pub delegate: Option<InscriptionId>,
    pub parent: Option<InscriptionId>,
}

fn push(builder: Builder, data: &[u8]) -> Result<Builder, ContractError> {
    let data = <&PushBytes>::try_from(data)
        .map_err(|e| ContractError::TermWrongValue(format!("envelope push: {e}")))?;
    Ok(builder.push_slice(data))
}

/// Appends the envelope of `envelope` to the spending condition `head`.
///
/// `OP_FALSE OP_IF "ord" [3 parent] [5 metadata]* [11 delegate] [1 content-type OP_0 content*]
/// OP_ENDIF`, metadata and content split into pushes of at most 520 bytes.
pub fn inscription_script(head: &Script, envelope: &Envelope) -> Result<ScriptBuf, ContractError> {
    let mut builder = Builder::from(head.to_bytes())
        .push_opcode(OP_FALSE)
        .push_opcode(OP_IF);
    builder = push(builder, ORD_TAG)?;

    if let Some(parent) = &envelope.parent {
        builder = push(builder, PARENT_TAG)?;
        builder = push(builder, &parent.to_bytes())?;
    }
    if let Some(metadata) = &envelope.metadata {
        for chunk in metadata.chunks(MAX_PUSH) {
            builder = push(builder, METADATA_TAG)?;
            builder = push(builder, chunk)?;
        }
    }
    if let Some(delegate) = &envelope.delegate {
        builder = push(builder, DELEGATE_TAG)?;
        builder = push(builder, &delegate.to_bytes())?;
    }
    if let Some(content) = &envelope.content {
        let content_type = envelope
            .content_type
            .as_deref()
            .ok_or_else(|| ContractError::TermMissing("content_type".into()))?;
        builder = push(builder, CONTENT_TYPE_TAG)?;
        builder = push(builder, content_type.as_bytes())?;
        builder = builder.push_opcode(OP_FALSE);
        for chunk in content.chunks(MAX_PUSH) {
            builder = push(builder, chunk)?;
        }
    }

    Ok(builder.push_opcode(OP_ENDIF).into_script())
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        opcodes::all::OP_CHECKSIG,
        script::Instruction,
        secp256k1::{Keypair, SECP256K1},
    };
    use utxord_taproot::signature_pubkeys;

    use super::*;

    fn head() -> (ScriptBuf, bitcoin::secp256k1::XOnlyPublicKey) {
        let pk = Keypair::from_seckey_slice(SECP256K1, &[3; 32])
            .expect("valid key")
            .x_only_public_key()
            .0;
        (Builder::new().push_x_only_key(&pk).push_opcode(OP_CHECKSIG).into_script(), pk)
    }

    fn pushes(script: &Script) -> Vec<Vec<u8>> {
        script
            .instructions()
            .filter_map(|i| match i {
                Ok(Instruction::PushBytes(b)) => Some(b.as_bytes().to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_content_is_chunked() {
        let (head, pk) = head();
        let envelope = Envelope {
            content_type: Some("text/plain".into()),
            content: Some(vec![b'a'; 1200]),
            ..Envelope::default()
        };
        let script = inscription_script(&head, &envelope).expect("script");
        let pushes = pushes(&script);

        // key, OP_FALSE, "ord", tag, type, OP_0 separator, three chunks
        assert_eq!(pushes.len(), 9);
        assert!(pushes[1].is_empty());
        assert_eq!(pushes[2], b"ord");
        assert_eq!(pushes[3], vec![1]);
        assert_eq!(pushes[4], b"text/plain");
        assert!(pushes[5].is_empty());
        assert_eq!(pushes[6].len(), 520);
        assert_eq!(pushes[8].len(), 160);
        assert_eq!(signature_pubkeys(&script), vec![pk]);
    }

    #[test]
    fn test_parent_precedes_content() {
        let (head, _) = head();
        let parent: InscriptionId = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeffi1"
            .parse()
            .expect("id");
        let envelope = Envelope {
            content_type: Some("image/png".into()),
            content: Some(vec![0; 10]),
            parent: Some(parent),
            metadata: Some(vec![0xa0]),
            ..Envelope::default()
        };
        let pushes = pushes(&inscription_script(&head, &envelope).expect("script"));
        assert_eq!(pushes[3], vec![3]);
        assert_eq!(pushes[4], parent.to_bytes());
        assert_eq!(pushes[5], vec![5]);
        assert_eq!(pushes[7], vec![1]);
    }

    #[test]
    fn test_content_requires_type() {
        let (head, _) = head();
        let envelope = Envelope {
            content: Some(vec![1, 2, 3]),
            ..Envelope::default()
        };
        let err = inscription_script(&head, &envelope).expect_err("no content type");
        assert_eq!(err.kind(), utxord_btc_types::ErrorKind::TermMissing);
    }
}
