//! Process-wide plumbing shared by utxord tools.

pub mod logging;
