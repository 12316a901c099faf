use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid};
use serde::{Deserialize, Serialize};

use crate::{ContractError, Destination, DestinationRepr, WitnessStack};

/// Output of a previous transaction available to a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub nout: u32,
    pub destination: Destination,
}

impl Utxo {
    pub fn new(txid: Txid, nout: u32, destination: Destination) -> Self {
        Self {
            txid,
            nout,
            destination,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.nout)
    }

    pub fn amount(&self) -> Amount {
        self.destination.amount()
    }

    pub fn tx_out(&self) -> Result<TxOut, ContractError> {
        self.destination.required_tx_out()
    }
}

/// A [`Utxo`] being spent, with the witness gathered for it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub utxo: Utxo,
    pub witness: WitnessStack,
}

impl TxInput {
    pub fn new(utxo: Utxo) -> Self {
        Self {
            utxo,
            witness: WitnessStack::new(),
        }
    }

    pub fn with_witness(utxo: Utxo, witness: WitnessStack) -> Self {
        Self { utxo, witness }
    }

    /// Transaction input carrying the gathered witness, or a same-sized placeholder while
    /// nothing has been gathered yet.
    pub fn to_txin(&self) -> Result<TxIn, ContractError> {
        let witness = if self.witness.is_empty() {
            self.utxo.destination.dummy_witness()?
        } else {
            self.witness.clone()
        };
        Ok(TxIn {
            previous_output: self.utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: witness.to_witness(),
        })
    }

    /// Merges a counterpart's view of the same input.
    pub fn merge(&mut self, other: &TxInput) -> Result<(), ContractError> {
        if self.utxo != other.utxo {
            return Err(ContractError::TermMismatch(format!(
                "utxo {}",
                self.utxo.outpoint()
            )));
        }
        self.witness.merge(&other.witness)
    }

    pub fn to_repr(&self, with_witness: bool) -> UtxoRepr {
        UtxoRepr::Utxo {
            txid: self.utxo.txid,
            nout: self.utxo.nout,
            destination: self.utxo.destination.to_repr(),
            witness: if with_witness {
                self.witness.clone()
            } else {
                WitnessStack::new()
            },
        }
    }

    pub fn from_repr(repr: UtxoRepr, network: Network) -> Result<Self, ContractError> {
        let UtxoRepr::Utxo {
            txid,
            nout,
            destination,
            witness,
        } = repr;
        Ok(Self {
            utxo: Utxo::new(txid, nout, Destination::from_repr(destination, network)?),
            witness,
        })
    }
}

/// JSON shape of a [`TxInput`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UtxoRepr {
    Utxo {
        txid: Txid,
        nout: u32,
        destination: DestinationRepr,
        #[serde(default, skip_serializing_if = "WitnessStack::is_empty")]
        witness: WitnessStack,
    },
}
