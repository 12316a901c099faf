//! Bitcoin building blocks shared by the contracts: destinations, inputs with co-signed
//! witnesses, fee arithmetic, key lookup, signing and signature verification.

mod destination;
mod errors;
pub mod fee;
mod keys;
mod signer;
mod utxo;
mod verify;
mod witness;

pub use destination::*;
pub use errors::*;
pub use keys::*;
pub use signer::*;
pub use utxo::*;
pub use verify::*;
pub use witness::*;
