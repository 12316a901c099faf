//! Multi-party bitcoin contracts built up through phase-tagged JSON snapshots.
//!
//! Each builder owns the authoritative terms of one protocol. Parties exchange snapshots taken
//! at a phase, reconcile them into their own copy and add their signatures until the final
//! transactions are complete.

pub mod builder;
pub mod inscription;
pub mod phase;
pub mod reconcile;
pub mod simple_tx;
pub mod swap;
pub mod trustless_swap;

pub use builder::{CommonParams, ContractBuilder};
pub use inscription::{InscriptionBuilder, InscriptionPhase, InscriptionType};
pub use phase::{phase_chain, ContractPhase, PhasedContract};
pub use reconcile::{reconcile, reconcile_input, reconcile_inputs};
pub use simple_tx::{SimpleTransaction, TxPhase};
pub use swap::{SwapInscriptionBuilder, SwapPhase};
pub use trustless_swap::{TrustlessSwapBuilder, TrustlessSwapPhase};
