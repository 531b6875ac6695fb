use bitcoin::BlockHash;
use std::path::PathBuf;
use subcoin_utxo_storage::UtxoKey;

/// Errors that can occur while building, storing or loading UTXO commitments.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] subcoin_utxo_storage::Error),

    #[error(transparent)]
    Crypto(#[from] subcoin_crypto::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A recomputed accumulator differs from the declared one.
    #[error("Accumulator mismatch for {context}: expected {expected}, got {actual}")]
    AccumulatorMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Count mismatch for {context}: expected {expected}, got {actual}")]
    CountMismatch {
        context: String,
        expected: u64,
        actual: u64,
    },

    #[error("Malformed committed entry: {0}")]
    MalformedEntry(String),

    #[error("Malformed manifest: {0}")]
    InvalidManifest(String),

    #[error("Sub-bucket file {} is not sorted", .0.display())]
    UnsortedFile(PathBuf),

    /// The source entries were not in ascending key order.
    #[error("UTXO {0} is out of order")]
    UnsortedInput(UtxoKey),

    #[error("Commitment for block {0} not found")]
    NotFound(BlockHash),

    #[error("Commitment build cancelled")]
    Cancelled,

    #[error("Commitment worker thread panicked")]
    WorkerPanicked,
}
