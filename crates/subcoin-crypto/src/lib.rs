//! Subcoin Crypto Primitives.
//!
//! Currently this crate only provides [`EcMultiset`], the elliptic curve multiset hash used to
//! commit to the UTXO set.

pub mod ec_multiset;

pub use ec_multiset::{EMPTY_HASH, EMPTY_PUBLIC_KEY, EcMultiset};

/// Errors raised by the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bytes are not a valid compressed secp256k1 point.
    #[error("Invalid multiset public key: {0}")]
    InvalidPublicKey(String),
}
