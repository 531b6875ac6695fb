//! Error types for the UTXO ledger.

use crate::UtxoKey;

/// Errors that can occur during UTXO ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RocksDB error.
    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    /// Bincode serialization/deserialization error.
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by a durable store backend.
    #[error("Durable store error: {0}")]
    Backend(String),

    /// The durable store rejected a flush. The in-memory entries were kept.
    #[error("Failed to persist {entries} evicted entries: {source}")]
    DurableWriteFailure {
        entries: usize,
        #[source]
        source: Box<Error>,
    },

    /// An unspent output with the same key already exists.
    #[error("Duplicate UTXO: {0}")]
    DuplicateUtxo(UtxoKey),

    /// A stored key or value could not be decoded.
    #[error("Corrupt entry: {0}")]
    CorruptEntry(String),

    /// A reorg operation hit an entry in a state it cannot handle.
    #[error("Unexpected UTXO state for {key}: flags {flags:#05b}")]
    UnexpectedState { key: UtxoKey, flags: u8 },

    /// Storage not initialized.
    #[error("Storage not initialized")]
    NotInitialized,
}
