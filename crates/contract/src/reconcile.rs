//! Immutable-once-set merging of contract fields.

use std::fmt;

use utxord_btc_types::{ContractError, TxInput};

/// Merges `incoming` into `slot`.
///
/// An empty slot takes the incoming value, an equal value is accepted as is and a differing
/// value fails with a mismatch leaving `slot` untouched. An absent incoming value never
/// clears the slot.
pub fn reconcile<T>(slot: &mut Option<T>, incoming: Option<T>, name: &str) -> Result<(), ContractError>
where
    T: PartialEq + fmt::Debug,
{
    let Some(value) = incoming else {
        return Ok(());
    };
    match slot {
        None => {
            *slot = Some(value);
            Ok(())
        }
        Some(existing) if *existing == value => Ok(()),
        Some(existing) => Err(ContractError::TermMismatch(format!(
            "{name}: {existing:?} != {value:?}"
        ))),
    }
}

/// Merges a single input: an empty slot takes it, a known one must spend the same output and
/// gets its witness merged.
pub fn reconcile_input(slot: &mut Option<TxInput>, incoming: TxInput, name: &str) -> Result<(), ContractError> {
    match slot {
        None => {
            *slot = Some(incoming);
            Ok(())
        }
        Some(known) => known
            .merge(&incoming)
            .map_err(|e| ContractError::TermMismatch(name.to_owned()).caused_by(e)),
    }
}

/// Merges a counterpart's list of inputs position by position.
///
/// Inputs already known must spend the same outputs; their witnesses are merged slot by slot.
/// Inputs past the known ones are appended. On failure `existing` is left untouched.
pub fn reconcile_inputs(
    existing: &mut Vec<TxInput>,
    incoming: Vec<TxInput>,
    name: &str,
) -> Result<(), ContractError> {
    if incoming.is_empty() {
        return Ok(());
    }
    if incoming.len() < existing.len() {
        return Err(ContractError::TermMismatch(format!(
            "{name} size: {} < {}",
            incoming.len(),
            existing.len()
        )));
    }

    let mut merged = existing.clone();
    for (i, input) in incoming.into_iter().enumerate() {
        match merged.get_mut(i) {
            Some(known) => known
                .merge(&input)
                .map_err(|e| ContractError::TermMismatch(format!("{name}[{i}]")).caused_by(e))?,
            None => merged.push(input),
        }
    }
    *existing = merged;
    Ok(())
}
