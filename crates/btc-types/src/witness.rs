use bitcoin::Witness;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::ContractError;

/// Witness items of an input, addressable by index.
///
/// Each co-signer fills its own slot. A slot accepts a new value only while it is empty or
/// an all-zero placeholder; once it carries a real value, only that same value is accepted.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WitnessStack(#[serde_as(as = "Vec<Hex>")] Vec<Vec<u8>>);

/// Empty or all-zero items stand in for signatures not made yet.
pub fn is_placeholder(item: &[u8]) -> bool {
    item.iter().all(|b| *b == 0)
}

impl WitnessStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<Vec<u8>>) -> Self {
        Self(items)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.0.get(idx).map(Vec::as_slice)
    }

    pub fn items(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Whether every slot carries a real value.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|item| !is_placeholder(item))
    }

    /// Fills slot `idx`, growing the stack with empty slots as needed.
    pub fn set(&mut self, idx: usize, value: Vec<u8>) -> Result<(), ContractError> {
        if idx >= self.0.len() {
            self.0.resize(idx + 1, Vec::new());
        }
        let slot = &mut self.0[idx];
        if is_placeholder(slot) || *slot == value {
            *slot = value;
            Ok(())
        } else if is_placeholder(&value) {
            Ok(())
        } else {
            Err(ContractError::TermMismatch(format!("witness[{idx}]")))
        }
    }

    /// Merges every slot of `other`; on failure `self` is left untouched.
    pub fn merge(&mut self, other: &WitnessStack) -> Result<(), ContractError> {
        let mut merged = self.clone();
        for (idx, item) in other.0.iter().enumerate() {
            merged.set(idx, item.clone())?;
        }
        *self = merged;
        Ok(())
    }

    pub fn to_witness(&self) -> Witness {
        Witness::from_slice(&self.0)
    }
}

impl From<Witness> for WitnessStack {
    fn from(witness: Witness) -> Self {
        Self(witness.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_placeholder_slots() {
        let mut stack = WitnessStack::from_items(vec![vec![0; 64], vec![0; 65], vec![1, 2, 3]]);
        assert!(!stack.is_complete());

        stack.set(1, vec![7; 65]).expect("placeholder is replaceable");
        stack.set(0, vec![8; 64]).expect("placeholder is replaceable");
        assert!(stack.is_complete());
        assert_eq!(stack.get(1), Some(&[7u8; 65][..]));
    }

    #[test]
    fn test_real_value_is_not_overwritten() {
        let mut stack = WitnessStack::new();
        stack.set(0, vec![1; 64]).expect("empty slot");
        stack.set(0, vec![1; 64]).expect("same value is accepted");

        let err = stack.set(0, vec![2; 64]).expect_err("different value must be rejected");
        assert_eq!(err, ContractError::TermMismatch("witness[0]".into()));
        assert_eq!(stack.get(0), Some(&[1u8; 64][..]), "original value kept");

        stack.set(0, vec![0; 64]).expect("placeholder over real value is ignored");
        assert_eq!(stack.get(0), Some(&[1u8; 64][..]));
    }

    #[test]
    fn test_set_grows_stack() {
        let mut stack = WitnessStack::new();
        stack.set(2, vec![5]).expect("grow");
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.get(0), Some(&[][..]));
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let mut stack = WitnessStack::from_items(vec![vec![0; 64], vec![9; 65]]);
        let incoming = WitnessStack::from_items(vec![vec![3; 64], vec![4; 65]]);

        assert!(stack.merge(&incoming).is_err());
        assert_eq!(stack.get(0), Some(&[0u8; 64][..]), "first slot must not be half-merged");
    }

    #[test]
    fn test_json_is_hex_array() {
        let stack = WitnessStack::from_items(vec![vec![0xab, 0xcd], vec![]]);
        let json = serde_json::to_string(&stack).expect("serialize");
        assert_eq!(json, r#"["abcd",""]"#);
        let back: WitnessStack = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, stack);
    }
}
