//! Weighted tapscript Merkle tree and the taproot commitment derived from it.

use std::{cmp::Reverse, collections::BinaryHeap};

use bitcoin::{
    key::{Parity, TapTweak, TweakedPublicKey, UntweakedPublicKey},
    taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootMerkleBranch},
    Address, Network, Script, ScriptBuf,
};
use secp256k1::SECP256K1;

/// Tapscript tree shaped by the byte length of its leaf scripts.
///
/// Construction repeatedly combines the two lightest subtrees, ties broken by the order in
/// which the subtrees were created (leaves first, in insertion order). Heavier scripts end up
/// closer to the root, so revealing them costs fewer control block bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapscriptTree {
    leaves: Vec<ScriptBuf>,
    /// Sibling hashes for every leaf, ordered from the leaf up to the root.
    paths: Vec<Vec<TapNodeHash>>,
    root: Option<TapNodeHash>,
}

struct Subtree {
    hash: TapNodeHash,
    leaves: Vec<usize>,
}

impl TapscriptTree {
    pub fn new(leaves: impl IntoIterator<Item = ScriptBuf>) -> Self {
        let leaves: Vec<ScriptBuf> = leaves.into_iter().collect();
        let mut paths = vec![Vec::new(); leaves.len()];

        let mut subtrees: Vec<Subtree> = leaves
            .iter()
            .enumerate()
            .map(|(i, script)| Subtree {
                hash: TapLeafHash::from_script(script, LeafVersion::TapScript).into(),
                leaves: vec![i],
            })
            .collect();

        // (weight, creation sequence) so equal weights pop in creation order
        let mut queue: BinaryHeap<Reverse<(usize, usize)>> = leaves
            .iter()
            .enumerate()
            .map(|(i, script)| Reverse((script.len(), i)))
            .collect();

        while queue.len() > 1 {
            let (Some(Reverse((weight_a, a))), Some(Reverse((weight_b, b)))) =
                (queue.pop(), queue.pop())
            else {
                break;
            };

            let (hash_a, hash_b) = (subtrees[a].hash, subtrees[b].hash);
            for &leaf in &subtrees[a].leaves {
                paths[leaf].push(hash_b);
            }
            for &leaf in &subtrees[b].leaves {
                paths[leaf].push(hash_a);
            }

            let mut members = std::mem::take(&mut subtrees[a].leaves);
            members.append(&mut subtrees[b].leaves);
            subtrees.push(Subtree {
                hash: TapNodeHash::from_node_hashes(hash_a, hash_b),
                leaves: members,
            });
            queue.push(Reverse((weight_a + weight_b, subtrees.len() - 1)));
        }

        let root = queue.pop().map(|Reverse((_, idx))| subtrees[idx].hash);

        Self {
            leaves,
            paths,
            root,
        }
    }

    /// Leaf scripts in insertion order.
    pub fn leaves(&self) -> &[ScriptBuf] {
        &self.leaves
    }

    /// Merkle root, `None` for an empty tree.
    pub fn root(&self) -> Option<TapNodeHash> {
        self.root
    }

    /// Sibling hashes proving membership of `script`, leaf level first.
    pub fn script_path(&self, script: &Script) -> Option<&[TapNodeHash]> {
        let idx = self.leaves.iter().position(|leaf| leaf.as_script() == script)?;
        Some(&self.paths[idx])
    }

    pub fn depth(&self, script: &Script) -> Option<usize> {
        self.script_path(script).map(<[TapNodeHash]>::len)
    }
}

/// Internal key, script tree and the tweaked output key committing to both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootCommitment {
    internal_key: UntweakedPublicKey,
    tree: TapscriptTree,
    output_key: TweakedPublicKey,
    parity: Parity,
}

impl TaprootCommitment {
    pub fn new(internal_key: UntweakedPublicKey, leaves: impl IntoIterator<Item = ScriptBuf>) -> Self {
        let tree = TapscriptTree::new(leaves);
        let (output_key, parity) = internal_key.tap_tweak(SECP256K1, tree.root());
        Self {
            internal_key,
            tree,
            output_key,
            parity,
        }
    }

    /// Commitment without scripts, tweaked as BIP86 prescribes.
    pub fn key_only(internal_key: UntweakedPublicKey) -> Self {
        Self::new(internal_key, [])
    }

    pub fn internal_key(&self) -> UntweakedPublicKey {
        self.internal_key
    }

    pub fn output_key(&self) -> TweakedPublicKey {
        self.output_key
    }

    pub fn parity(&self) -> Parity {
        self.parity
    }

    pub fn merkle_root(&self) -> Option<TapNodeHash> {
        self.tree.root()
    }

    pub fn tree(&self) -> &TapscriptTree {
        &self.tree
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.output_key)
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.output_key, network)
    }

    pub fn script_path(&self, script: &Script) -> Option<&[TapNodeHash]> {
        self.tree.script_path(script)
    }

    pub fn depth(&self, script: &Script) -> Option<usize> {
        self.tree.depth(script)
    }

    /// Control block for spending `script`, or `None` if the script is not a leaf.
    pub fn control_block(&self, script: &Script) -> Option<ControlBlock> {
        let path = self.tree.script_path(script)?;
        Some(ControlBlock {
            leaf_version: LeafVersion::TapScript,
            output_key_parity: self.parity,
            internal_key: self.internal_key,
            merkle_branch: TaprootMerkleBranch::try_from(path.to_vec()).ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{secp256k1::Keypair, taproot::TaprootBuilder};
    use proptest::prelude::*;

    use super::*;

    fn internal_key() -> UntweakedPublicKey {
        Keypair::from_seckey_slice(SECP256K1, &[0x11; 32])
            .expect("valid secret key")
            .x_only_public_key()
            .0
    }

    fn script_of_len(len: usize, fill: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![fill; len])
    }

    #[test]
    fn test_empty_tree_has_no_root() {
        let tree = TapscriptTree::new([]);
        assert!(tree.root().is_none(), "empty tree must not have a root");
        assert!(tree.leaves().is_empty());
    }

    #[test]
    fn test_single_leaf_is_root() {
        let script = script_of_len(10, 0x51);
        let tree = TapscriptTree::new([script.clone()]);

        let leaf_hash: TapNodeHash = TapLeafHash::from_script(&script, LeafVersion::TapScript).into();
        assert_eq!(tree.root(), Some(leaf_hash), "single leaf should be the root");
        assert_eq!(tree.depth(&script), Some(0), "single leaf has an empty path");
    }

    #[test]
    fn test_two_leaves_match_reference_builder() {
        let a = script_of_len(70, 0x51);
        let b = script_of_len(37, 0x52);
        let commitment = TaprootCommitment::new(internal_key(), [a.clone(), b.clone()]);

        let reference = TaprootBuilder::new()
            .add_leaf(1, a.clone())
            .expect("add leaf a")
            .add_leaf(1, b.clone())
            .expect("add leaf b")
            .finalize(SECP256K1, internal_key())
            .expect("finalize reference tree");

        assert_eq!(commitment.merkle_root(), reference.merkle_root());
        assert_eq!(commitment.output_key(), reference.output_key());
        assert_eq!(commitment.parity(), reference.output_key_parity());
        assert_eq!(commitment.depth(&a), Some(1));
        assert_eq!(commitment.depth(&b), Some(1));
    }

    #[test]
    fn test_lightest_leaves_combine_first() {
        let heavy = script_of_len(70, 0x51);
        let light1 = script_of_len(37, 0x52);
        let light2 = script_of_len(37, 0x53);
        let tree = TapscriptTree::new([heavy.clone(), light1.clone(), light2.clone()]);

        assert_eq!(tree.depth(&heavy), Some(1), "heavy leaf should sit next to the root");
        assert_eq!(tree.depth(&light1), Some(2));
        assert_eq!(tree.depth(&light2), Some(2));

        let h1: TapNodeHash = TapLeafHash::from_script(&light1, LeafVersion::TapScript).into();
        let h2: TapNodeHash = TapLeafHash::from_script(&light2, LeafVersion::TapScript).into();
        assert_eq!(
            tree.script_path(&light1).expect("leaf present")[0],
            h2,
            "first sibling of a light leaf is the other light leaf"
        );
        assert_eq!(tree.script_path(&light2).expect("leaf present")[0], h1);
    }

    #[test]
    fn test_control_block_layout() {
        let a = script_of_len(70, 0x51);
        let b = script_of_len(37, 0x52);
        let c = script_of_len(37, 0x53);
        let commitment = TaprootCommitment::new(internal_key(), [a, b.clone(), c]);

        let cb = commitment.control_block(&b).expect("control block for leaf");
        let bytes = cb.serialize();
        assert_eq!(bytes.len(), 33 + 32 * 2, "one 32-byte hash per depth level");
        assert_eq!(bytes[0] & 0xfe, 0xc0, "tapscript leaf version");
        assert_eq!(bytes[0] & 0x01, commitment.parity().to_u8());
        assert_eq!(&bytes[1..33], &internal_key().serialize()[..]);
        assert!(cb.verify_taproot_commitment(SECP256K1, commitment.output_key().to_inner(), &b));
    }

    #[test]
    fn test_control_block_for_unknown_script() {
        let commitment = TaprootCommitment::new(internal_key(), [script_of_len(10, 0x51)]);
        assert!(commitment.control_block(&script_of_len(11, 0x51)).is_none());
    }

    #[test]
    fn test_key_only_matches_bip86_address() {
        let commitment = TaprootCommitment::key_only(internal_key());
        let expected = Address::p2tr(SECP256K1, internal_key(), None, Network::Regtest);
        assert_eq!(commitment.address(Network::Regtest), expected);
        assert_eq!(commitment.script_pubkey(), expected.script_pubkey());
    }

    proptest! {
        #[test]
        fn proptest_every_leaf_proves_membership(lens in prop::collection::vec(1usize..120, 1..9)) {
            let leaves: Vec<ScriptBuf> = lens
                .iter()
                .enumerate()
                .map(|(i, len)| {
                    let mut bytes = vec![0x51; *len];
                    bytes.push(i as u8);
                    ScriptBuf::from_bytes(bytes)
                })
                .collect();
            let commitment = TaprootCommitment::new(internal_key(), leaves.clone());

            for leaf in &leaves {
                let cb = commitment.control_block(leaf).expect("leaf has control block");
                prop_assert_eq!(
                    cb.merkle_branch.len(),
                    commitment.depth(leaf).expect("leaf has depth")
                );
                prop_assert!(cb.verify_taproot_commitment(
                    SECP256K1,
                    commitment.output_key().to_inner(),
                    leaf
                ));
            }
        }
    }
}
