//! Operator tooling for UTXO commitments.
//!
//! Provides the `utxo-commit` binary which builds commitments from a UTXO dump, verifies
//! downloaded payload files against a manifest and inspects single payload files.

mod cli;
mod commands;
mod error;
mod utxo_csv;

pub use self::cli::run;
pub use self::error::{Error, Result};
