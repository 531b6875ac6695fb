//! UTXO ledger storage.
//!
//! The ledger is split in two tiers:
//!
//! - [`UtxoWorkingSet`]: bounded in-memory map of recently created and spent outputs, each
//!   carrying [`SpentState`] flags that track whether a durable copy may exist.
//! - [`DurableStore`]: sorted key-value store holding the flushed baseline, either
//!   [`MemoryStore`] or `RocksDbStore` (feature `rocksdb`).
//!
//! Outputs migrate from the first tier to the second by eviction, oldest block height first.

mod entry;
mod error;
mod flags;
mod metrics;
mod options;
#[cfg(feature = "rocksdb")]
mod rocksdb_store;
mod snapshot;
mod store;
mod undo;
mod working_set;

pub use self::entry::{
    CreatedOutput, SPENT_AMOUNT, UNKNOWN_BLOCK_HEIGHT, UtxoEntry, UtxoKey, UtxoValue,
};
pub use self::error::Error;
pub use self::flags::SpentState;
pub use self::metrics::Metrics;
pub use self::options::{DEFAULT_MAX_UTXO_COUNT, WorkingSetOptions, bip30_duplicate_txids};
#[cfg(feature = "rocksdb")]
pub use self::rocksdb_store::RocksDbStore;
pub use self::snapshot::{LedgerSnapshot, UnspentEntries};
pub use self::store::{DurableStore, MemoryStore, StoreBatch, StoreOp, StoreSnapshot};
pub use self::undo::BlockUndo;
pub use self::working_set::{FlushSummary, UtxoWorkingSet};

/// Result type for UTXO storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Column family names.
#[cfg(feature = "rocksdb")]
pub(crate) mod cf {
    /// Unspent outputs: key = txid (32, display order) || vout (4 BE), value = bincode
    /// [`UtxoValue`](crate::UtxoValue).
    pub const UTXOS: &str = "utxos";
    /// Metadata (utxo count, committed block height).
    pub const META: &str = "meta";
}

/// Metadata keys.
#[cfg(feature = "rocksdb")]
pub(crate) mod meta_keys {
    pub const UTXO_COUNT: &[u8] = b"utxo_count";
    pub const COMMITTED_BLOCK_HEIGHT: &[u8] = b"committed_block_height";
}
