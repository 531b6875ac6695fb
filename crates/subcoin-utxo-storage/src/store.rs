//! Durable backing store of the ledger.

use crate::{Result, UtxoEntry, UtxoKey, UtxoValue};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A single mutation of a [`StoreBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put(UtxoKey, UtxoValue),
    Delete(UtxoKey),
}

/// Mutations applied atomically by [`DurableStore::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    ops: Vec<StoreOp>,
    committed_block_height: Option<u32>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: UtxoKey, value: UtxoValue) {
        self.ops.push(StoreOp::Put(key, value));
    }

    pub fn delete(&mut self, key: UtxoKey) {
        self.ops.push(StoreOp::Delete(key));
    }

    /// Records that the store reflects the ledger right after `block_height` once the batch
    /// is applied.
    pub fn set_committed_block_height(&mut self, block_height: u32) {
        self.committed_block_height = Some(block_height);
    }

    pub fn committed_block_height(&self) -> Option<u32> {
        self.committed_block_height
    }

    /// Number of entry operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.committed_block_height.is_none()
    }

    /// Number of `Put` operations.
    pub fn puts(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, StoreOp::Put(..)))
            .count()
    }

    pub fn into_ops(self) -> Vec<StoreOp> {
        self.ops
    }
}

/// Point-in-time view of a durable store.
pub trait StoreSnapshot {
    /// Iterates over all stored entries in ascending [`UtxoKey`] order.
    fn entries(&self) -> Box<dyn Iterator<Item = Result<UtxoEntry>> + '_>;
}

/// Sorted key-value store holding the flushed baseline of the UTXO set.
///
/// Only unspent values are ever stored; a spent output is represented by the absence of its
/// key.
pub trait DurableStore: Send + Sync {
    /// Applies all operations of `batch` atomically.
    fn write_batch(&self, batch: StoreBatch) -> Result<()>;

    /// Point lookup.
    fn get(&self, key: &UtxoKey) -> Result<Option<UtxoValue>>;

    /// Returns `true` if `key` is stored.
    fn contains(&self, key: &UtxoKey) -> Result<bool> {
        self.get(key).map(|value| value.is_some())
    }

    /// Number of stored entries.
    fn len(&self) -> Result<u64>;

    /// Height of the last checkpoint written with
    /// [`StoreBatch::set_committed_block_height`], `None` if there was none.
    fn committed_block_height(&self) -> Result<Option<u32>>;

    fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Takes a consistent snapshot for iteration.
    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>>;
}

/// [`DurableStore`] kept in memory, used by tests and tools.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<UtxoKey, UtxoValue>>,
    committed_block_height: RwLock<Option<u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = UtxoEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|UtxoEntry { key, value }| (key, value))
            .collect();
        Self {
            entries: RwLock::new(entries),
            committed_block_height: RwLock::new(None),
        }
    }
}

struct MemorySnapshot {
    entries: BTreeMap<UtxoKey, UtxoValue>,
}

impl StoreSnapshot for MemorySnapshot {
    fn entries(&self) -> Box<dyn Iterator<Item = Result<UtxoEntry>> + '_> {
        Box::new(
            self.entries
                .iter()
                .map(|(key, value)| Ok(UtxoEntry::new(*key, value.clone()))),
        )
    }
}

impl DurableStore for MemoryStore {
    fn write_batch(&self, batch: StoreBatch) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(block_height) = batch.committed_block_height() {
            *self.committed_block_height.write() = Some(block_height);
        }
        for op in batch.into_ops() {
            match op {
                StoreOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                StoreOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &UtxoKey) -> Result<Option<UtxoValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.entries.read().len() as u64)
    }

    fn committed_block_height(&self) -> Result<Option<u32>> {
        Ok(*self.committed_block_height.read())
    }

    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>> {
        Ok(Box::new(MemorySnapshot {
            entries: self.entries.read().clone(),
        }))
    }
}
