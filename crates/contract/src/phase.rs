//! Phase-tagged contract engine.
//!
//! A contract is handed between parties as a JSON snapshot taken at some phase. Every phase
//! names the phases it builds on, so validating a phase re-validates everything it depends on
//! and serializing it emits every field introduced at or before it.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::*;
use utxord_btc_types::ContractError;

pub const NAME_CONTRACT_TYPE: &str = "contract_type";
pub const NAME_PARAMS: &str = "params";
pub const NAME_VERSION: &str = "protocol_version";
pub const NAME_PHASE: &str = "phase";

/// A step of a contract protocol.
pub trait ContractPhase: Copy + Eq + fmt::Debug + 'static {
    /// Every phase of the protocol, in protocol order.
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    /// Phases this one directly builds on.
    fn predecessors(self) -> &'static [Self];

    /// Whether `other` is this phase or one it transitively builds on.
    fn reaches(self, other: Self) -> bool {
        self == other || self.predecessors().iter().any(|p| p.reaches(other))
    }

    fn parse(name: &str) -> Result<Self, ContractError> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| ContractError::TermWrongValue(format!("{NAME_PHASE}: {name}")))
    }
}

/// `phase` and everything it builds on, earliest first, each phase once.
pub fn phase_chain<P: ContractPhase>(phase: P) -> Vec<P> {
    fn visit<P: ContractPhase>(phase: P, chain: &mut Vec<P>) {
        if chain.contains(&phase) {
            return;
        }
        for p in phase.predecessors() {
            visit(*p, chain);
        }
        chain.push(phase);
    }

    let mut chain = Vec::new();
    visit(phase, &mut chain);
    chain
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    contract_type: String,
    params: Value,
}

/// A contract that is built up by several parties exchanging phase snapshots.
///
/// Implementors describe their fields through [`PhasedContract::Params`] and supply the
/// per-phase checks; the wire envelope, version gating and all-or-nothing merging are shared.
pub trait PhasedContract: Clone {
    type Phase: ContractPhase;
    type Params: Serialize + DeserializeOwned;

    const CONTRACT_TYPE: &'static str;
    /// Version emitted by default.
    const PROTOCOL_VERSION: u32;
    const SUPPORTED_VERSIONS: &'static [u32];

    /// Fields visible at `phase` for the given protocol version.
    fn make_params(&self, version: u32, phase: Self::Phase) -> Result<Self::Params, ContractError>;

    /// Reconciles a counterpart's fields into `self`.
    ///
    /// Called on a scratch copy of the contract, so a failure may leave `self` half merged.
    fn merge_params(
        &mut self,
        params: Self::Params,
        version: u32,
        phase: Self::Phase,
    ) -> Result<(), ContractError>;

    /// Terms introduced at `phase` alone; predecessors are checked by the caller.
    fn check_phase_terms(&self, version: u32, phase: Self::Phase) -> Result<(), ContractError>;

    /// Signatures introduced at `phase` alone.
    fn check_phase_signatures(&self, _phase: Self::Phase) -> Result<(), ContractError> {
        Ok(())
    }

    fn check_version(version: u32) -> Result<(), ContractError> {
        if Self::SUPPORTED_VERSIONS.contains(&version) {
            Ok(())
        } else {
            Err(ContractError::Protocol(format!(
                "{} version {version} is not supported, allowed are {:?}",
                Self::CONTRACT_TYPE,
                Self::SUPPORTED_VERSIONS
            )))
        }
    }

    /// Validates `phase` and every phase it builds on, terms first, then signatures.
    fn check_contract_terms(&self, version: u32, phase: Self::Phase) -> Result<(), ContractError> {
        Self::check_version(version)?;
        let chain = phase_chain(phase);
        for p in &chain {
            debug!(contract = Self::CONTRACT_TYPE, phase = p.as_str(), "checking terms");
            self.check_phase_terms(version, *p)?;
        }
        for p in &chain {
            self.check_phase_signatures(*p)?;
        }
        Ok(())
    }

    fn serialize(&self, version: u32, phase: Self::Phase) -> Result<String, ContractError> {
        self.check_contract_terms(version, phase)?;

        let mut params = serde_json::to_value(self.make_params(version, phase)?)
            .map_err(|e| ContractError::TermWrongFormat(format!("{NAME_PARAMS}: {e}")))?;
        let fields = params
            .as_object_mut()
            .ok_or_else(|| ContractError::TermWrongFormat(NAME_PARAMS.into()))?;
        fields.insert(NAME_VERSION.into(), version.into());
        fields.insert(NAME_PHASE.into(), phase.as_str().into());

        let envelope = Envelope {
            contract_type: Self::CONTRACT_TYPE.into(),
            params,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| ContractError::TermWrongFormat(format!("{NAME_CONTRACT_TYPE}: {e}")))
    }

    /// Merges a counterpart's snapshot taken at `phase`.
    ///
    /// Either every field is merged and the resulting contract passes the checks of `phase`,
    /// or `self` is left untouched.
    fn deserialize(&mut self, data: &str, phase: Self::Phase) -> Result<(), ContractError> {
        let envelope: Envelope = serde_json::from_str(data)
            .map_err(|e| ContractError::TermWrongFormat(format!("contract: {e}")))?;
        if envelope.contract_type != Self::CONTRACT_TYPE {
            return Err(ContractError::Protocol(format!(
                "{NAME_CONTRACT_TYPE}: {}, expected {}",
                envelope.contract_type,
                Self::CONTRACT_TYPE
            )));
        }
        if !envelope.params.is_object() {
            return Err(ContractError::TermWrongFormat(NAME_PARAMS.into()));
        }

        let version = match envelope.params.get(NAME_VERSION) {
            None => return Err(ContractError::TermMissing(NAME_VERSION.into())),
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| ContractError::TermWrongFormat(NAME_VERSION.into()))?,
        };
        Self::check_version(version)?;

        let params: Self::Params = serde_json::from_value(envelope.params)
            .map_err(|e| ContractError::TermWrongFormat(format!("{NAME_PARAMS}: {e}")))?;

        let mut merged = self.clone();
        merged.merge_params(params, version, phase)?;
        merged.check_contract_terms(version, phase)?;
        *self = merged;

        info!(
            contract = Self::CONTRACT_TYPE,
            phase = phase.as_str(),
            version,
            "contract snapshot merged"
        );
        Ok(())
    }
}
