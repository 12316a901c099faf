//! Taproot commitments: weighted script trees, tweaked output keys, control blocks and the
//! leaf scripts the contracts commit to.

mod scripts;
mod tree;
mod unspendable;

pub use scripts::*;
pub use tree::*;
pub use unspendable::*;
