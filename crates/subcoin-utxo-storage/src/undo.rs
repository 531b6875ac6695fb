//! Block undo data for chain reorganizations.
//!
//! When a block is connected, the caller records the entries it spent and the keys it created.
//! Disconnecting the block replays the record backwards through
//! [`UtxoWorkingSet::revert_block`](crate::UtxoWorkingSet::revert_block).

use crate::{Result, UtxoEntry, UtxoKey};
use serde::{Deserialize, Serialize};

/// Undo data for a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// Entries that were spent in this block, restored on revert.
    pub spent_utxos: Vec<UtxoEntry>,

    /// Keys that were created in this block, removed on revert.
    pub created_keys: Vec<UtxoKey>,
}

impl BlockUndo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_spend(&mut self, entry: UtxoEntry) {
        self.spent_utxos.push(entry);
    }

    pub fn record_create(&mut self, key: UtxoKey) {
        self.created_keys.push(key);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }

    pub fn is_empty(&self) -> bool {
        self.spent_utxos.is_empty() && self.created_keys.is_empty()
    }
}
