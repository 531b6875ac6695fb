//! Bounded in-memory view of the UTXO set.
//!
//! # Locking
//!
//! All entries live behind a single [`RwLock`]. Every mutation (including the eviction it may
//! trigger and the durable write that eviction performs) runs under one write guard, so a
//! block's outputs are applied and flushed as a unit. Readers hold the read guard for the whole
//! lookup, including the read-through to the durable store, and therefore observe the state
//! either before or after a flush, never in between.

use crate::metrics::Metrics;
use crate::snapshot::LedgerSnapshot;
use crate::store::{DurableStore, StoreBatch};
use crate::{
    BlockUndo, CreatedOutput, Error, Result, SpentState, UNKNOWN_BLOCK_HEIGHT, UtxoEntry, UtxoKey,
    UtxoValue, WorkingSetOptions,
};
use bitcoin::Txid;
use parking_lot::RwLock;
use prometheus::Registry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

type Entries = BTreeMap<UtxoKey, UtxoValue>;

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Unspent entries written to the durable store.
    pub written: usize,
    /// Durable copies deleted because the entry was spent.
    pub deleted: usize,
    /// Entries removed from memory by eviction.
    pub evicted: usize,
    /// Spent entries dropped from memory.
    pub pruned_spent: usize,
}

impl FlushSummary {
    fn merge(&mut self, other: FlushSummary) {
        self.written += other.written;
        self.deleted += other.deleted;
        self.evicted += other.evicted;
        self.pruned_spent += other.pruned_spent;
    }
}

/// Value persisted for an unspent resident entry.
fn durable_value(value: &UtxoValue) -> UtxoValue {
    UtxoValue {
        spent_state: SpentState::IS_FLUSHED_TO_DISK,
        ..value.clone()
    }
}

/// Authoritative view of the unspent outputs created or spent since the last checkpoint, on top
/// of a [`DurableStore`] holding the flushed baseline.
pub struct UtxoWorkingSet<S> {
    store: Arc<S>,
    entries: RwLock<Entries>,
    options: WorkingSetOptions,
    duplicate_txids: HashSet<Txid>,
    metrics: Option<Metrics>,
}

impl<S: DurableStore> UtxoWorkingSet<S> {
    /// Constructs a new instance of [`UtxoWorkingSet`].
    pub fn new(store: Arc<S>, options: WorkingSetOptions) -> Self {
        Self::with_registry(store, options, None)
    }

    /// Constructs a new instance of [`UtxoWorkingSet`] reporting to `registry`.
    pub fn with_registry(
        store: Arc<S>,
        options: WorkingSetOptions,
        registry: Option<&Registry>,
    ) -> Self {
        let duplicate_txids = options.duplicate_txids.iter().copied().collect();
        let metrics = registry.and_then(|registry| {
            Metrics::register(registry)
                .map_err(|err| tracing::error!("Failed to register UTXO working set metrics: {err}"))
                .ok()
        });

        Self {
            store,
            entries: RwLock::new(BTreeMap::new()),
            options,
            duplicate_txids,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn options(&self) -> &WorkingSetOptions {
        &self.options
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    pub fn max_utxo_count(&self) -> usize {
        self.options.max_utxo_count
    }

    /// Number of resident entries, spent markers included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the resident value of `key` without consulting the durable store.
    pub fn resident_entry(&self, key: &UtxoKey) -> Option<UtxoValue> {
        self.entries.read().get(key).cloned()
    }

    /// Adds the outputs created by a block connected at `block_height`.
    ///
    /// Fails with [`Error::DuplicateUtxo`] without changing anything if one of the outputs
    /// already exists unspent, unless its txid is on the duplicate allow-list in which case the
    /// old output is overwritten. Triggers an eviction once the capacity is reached and returns
    /// its summary.
    ///
    /// If the durable write of that eviction fails, the inserted outputs are rolled back before
    /// the error is returned, leaving the working set as it was before the call. The same
    /// outputs can then be inserted again.
    pub fn insert_unspent_outputs(
        &self,
        outputs: Vec<CreatedOutput>,
        block_height: u32,
    ) -> Result<Option<FlushSummary>> {
        let mut entries = self.entries.write();

        let mut seen = HashSet::with_capacity(outputs.len());
        for output in &outputs {
            let key = output.key;
            if self.duplicate_txids.contains(&key.txid) {
                continue;
            }
            let exists = !seen.insert(key)
                || match entries.get(&key) {
                    Some(value) => !value.is_spent(),
                    None => self.store.contains(&key)?,
                };
            if exists {
                return Err(Error::DuplicateUtxo(key));
            }
        }

        let mut replaced = Vec::with_capacity(outputs.len());
        for output in outputs {
            let (key, mut value) = output.into_value(block_height);
            if let Some(existing) = entries.get(&key) {
                if !existing.is_spent() {
                    tracing::warn!(
                        "Duplicate txid at height {block_height}: {key} (BIP30 edge case)"
                    );
                }
                // The durable copy, if any, must be overwritten or deleted later on.
                if existing.spent_state.is_force_flush() {
                    value.spent_state.set_force_flush(true);
                }
            }
            replaced.push((key, entries.insert(key, value)));
        }

        let summary = if entries.len() >= self.options.max_utxo_count {
            if let Some(metrics) = &self.metrics {
                metrics.report_capacity_exceeded();
            }
            tracing::debug!(
                "UTXO working set reached capacity ({} >= {}) at height {block_height}",
                entries.len(),
                self.options.max_utxo_count
            );
            match self.evict(&mut entries) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    // Eviction removes nothing when its write fails.
                    for (key, previous) in replaced.into_iter().rev() {
                        match previous {
                            Some(value) => entries.insert(key, value),
                            None => entries.remove(&key),
                        };
                    }
                    self.report_resident(&entries);
                    return Err(err);
                }
            }
        } else {
            None
        };

        self.report_resident(&entries);

        Ok(summary)
    }

    /// Marks the outputs identified by `keys` as spent by a block at `spending_height`.
    ///
    /// Entries that never reached the durable store are dropped right away; all others are
    /// replaced by spent markers which delete the durable copy on the next flush.
    pub fn mark_spent(&self, keys: &[UtxoKey], spending_height: u32) {
        let mut entries = self.entries.write();

        let mut dropped = 0usize;
        for key in keys {
            match entries.remove(key) {
                Some(value) if value.spent_state.may_be_durable() => {
                    let tombstone = UtxoValue {
                        spent_state: SpentState::spent_tombstone(),
                        ..value
                    };
                    entries.insert(*key, tombstone);
                }
                Some(_) => dropped += 1,
                None => {
                    // Most likely flushed earlier.
                    entries.insert(*key, UtxoValue::tombstone(UNKNOWN_BLOCK_HEIGHT));
                }
            }
        }

        tracing::trace!(
            "Marked {} outputs spent at height {spending_height}, {dropped} dropped from memory",
            keys.len()
        );

        self.report_resident(&entries);
    }

    /// Looks up an unspent output.
    ///
    /// `Ok(None)` means the output either never existed or was spent and pruned; the two cases
    /// cannot be told apart.
    pub fn get_unspent_output(&self, key: &UtxoKey) -> Result<Option<UtxoValue>> {
        // Keep the read guard over the store lookup as well.
        let entries = self.entries.read();

        if let Some(value) = entries.get(key) {
            return Ok(value.is_unspent().then(|| value.clone()));
        }

        Ok(self.store.get(key)?.filter(UtxoValue::is_unspent))
    }

    /// Checkpoint flush for the chain tip at `block_height`.
    ///
    /// Writes every unspent entry that is not yet durable or is flagged `FORCE_FLUSH`; those
    /// stay resident, marked flushed. Spent entries are dropped from memory and their durable
    /// copies deleted. The same batch records `block_height` as the committed height. Afterwards
    /// the oldest entries are evicted until at most `max_utxo_count / 2` remain.
    ///
    /// On failure nothing in memory changes.
    pub fn commit_unspent_transaction_outputs(&self, block_height: u32) -> Result<FlushSummary> {
        let mut entries = self.entries.write();

        let mut summary = FlushSummary::default();
        let mut batch = StoreBatch::new();
        let mut flushed = Vec::new();
        let mut pruned = Vec::new();

        for (key, value) in entries.iter() {
            let state = value.spent_state;
            if state.is_spent() {
                if state.may_be_durable() {
                    batch.delete(*key);
                    summary.deleted += 1;
                }
                pruned.push(*key);
            } else if !state.is_flushed_to_disk() || state.is_force_flush() {
                batch.put(*key, durable_value(value));
                flushed.push(*key);
            }
        }

        summary.written = flushed.len();
        summary.pruned_spent = pruned.len();

        batch.set_committed_block_height(block_height);
        self.write_durable(batch)?;

        for key in &pruned {
            entries.remove(key);
        }
        for key in &flushed {
            if let Some(value) = entries.get_mut(key) {
                value.spent_state = SpentState::IS_FLUSHED_TO_DISK;
            }
        }

        if entries.len() > self.options.resident_target() {
            if entries.len() >= self.options.max_utxo_count {
                if let Some(metrics) = &self.metrics {
                    metrics.report_capacity_exceeded();
                }
            }
            summary.merge(self.evict(&mut entries)?);
        }

        self.report_resident(&entries);

        tracing::debug!(
            "Committed UTXO working set at height {block_height}: {} written, {} deleted, {} evicted, {} resident",
            summary.written,
            summary.deleted,
            summary.evicted,
            entries.len()
        );

        Ok(summary)
    }

    /// Reverts the creation of outputs when their block is disconnected.
    pub fn undo_creation(&self, keys: &[UtxoKey]) {
        let mut entries = self.entries.write();
        Self::undo_creation_inner(&mut entries, keys);
        self.report_resident(&entries);
    }

    /// Restores outputs that were spent by a disconnected block.
    ///
    /// The caller supplies the restored values, typically from [`BlockUndo`].
    pub fn undo_spending(&self, restored: Vec<UtxoEntry>) -> Result<()> {
        let mut entries = self.entries.write();
        let result = Self::undo_spending_inner(&mut entries, restored);
        self.report_resident(&entries);
        result
    }

    /// Disconnects a block using its undo data.
    pub fn revert_block(&self, undo: &BlockUndo) -> Result<()> {
        let mut entries = self.entries.write();
        // Restore inputs first so that outputs created and spent within the block end up
        // removed.
        let result = Self::undo_spending_inner(&mut entries, undo.spent_utxos.clone());
        Self::undo_creation_inner(&mut entries, &undo.created_keys);
        self.report_resident(&entries);
        result
    }

    /// Takes a point-in-time view of the whole ledger for commitment building.
    pub fn snapshot(&self) -> Result<LedgerSnapshot<'_>> {
        // Store writes only happen under the write guard, so both halves are consistent.
        let entries = self.entries.read();
        let durable = self.store.snapshot()?;
        Ok(LedgerSnapshot::new(durable, entries.clone()))
    }

    fn undo_creation_inner(entries: &mut Entries, keys: &[UtxoKey]) {
        for key in keys {
            let removed = entries.remove(key);
            // A missing entry may have been flushed before the reorg.
            if removed
                .as_ref()
                .is_none_or(|value| value.spent_state.may_be_durable())
            {
                let block_height = removed.map_or(UNKNOWN_BLOCK_HEIGHT, |value| value.block_height);
                entries.insert(*key, UtxoValue::tombstone(block_height));
            }
        }
    }

    fn undo_spending_inner(entries: &mut Entries, restored: Vec<UtxoEntry>) -> Result<()> {
        for UtxoEntry { key, value } in restored {
            let restored_value = |force_flush: bool| UtxoValue {
                spent_state: if force_flush {
                    SpentState::FORCE_FLUSH
                } else {
                    SpentState::unspent()
                },
                ..value.clone()
            };

            match entries.remove(&key) {
                Some(existing) if existing.block_height == UNKNOWN_BLOCK_HEIGHT => {
                    // A spent marker for an output that is still durable: dropping the marker
                    // exposes the durable copy again.
                    if !existing.is_spent() || !existing.spent_state.is_force_flush() {
                        return Err(Error::UnexpectedState {
                            key,
                            flags: existing.spent_state.to_u8(),
                        });
                    }
                }
                Some(existing) => {
                    entries.insert(key, restored_value(existing.spent_state.may_be_durable()));
                }
                None => {
                    // Unknown whether the output reached the durable store.
                    entries.insert(key, restored_value(true));
                }
            }
        }
        Ok(())
    }

    /// Evicts the oldest entries until `max_utxo_count / 2` remain.
    ///
    /// Entries are selected by ascending block height, ties broken by key. The durable write
    /// happens before anything is removed from memory.
    fn evict(&self, entries: &mut Entries) -> Result<FlushSummary> {
        let target = self.options.resident_target();
        let count = entries.len().saturating_sub(target);
        if count == 0 {
            return Ok(FlushSummary::default());
        }

        let mut candidates = entries
            .iter()
            .map(|(key, value)| (value.block_height, *key))
            .collect::<Vec<_>>();
        candidates.sort_unstable();
        candidates.truncate(count);

        let mut summary = FlushSummary::default();
        let mut batch = StoreBatch::new();

        for (_, key) in &candidates {
            let Some(value) = entries.get(key) else {
                continue;
            };
            let state = value.spent_state;
            if state.is_spent() {
                summary.pruned_spent += 1;
                if state.may_be_durable() {
                    batch.delete(*key);
                    summary.deleted += 1;
                }
            } else if !state.is_flushed_to_disk() || state.is_force_flush() {
                batch.put(*key, durable_value(value));
                summary.written += 1;
            }
        }

        if !batch.is_empty() {
            self.write_durable(batch)?;
        }

        for (_, key) in &candidates {
            entries.remove(key);
        }
        summary.evicted = candidates.len();

        if let Some(metrics) = &self.metrics {
            metrics.report_eviction(summary.evicted, summary.pruned_spent);
        }

        tracing::debug!(
            "Evicted {} UTXOs ({} written, {} deleted, {} spent dropped), {} resident",
            summary.evicted,
            summary.written,
            summary.deleted,
            summary.pruned_spent,
            entries.len()
        );

        Ok(summary)
    }

    fn write_durable(&self, batch: StoreBatch) -> Result<()> {
        let entries = batch.len();
        self.store.write_batch(batch).map_err(|err| {
            if let Some(metrics) = &self.metrics {
                metrics.report_durable_write_failure();
            }
            tracing::warn!("Failed to flush {entries} UTXOs to the durable store: {err}");
            Error::DurableWriteFailure {
                entries,
                source: Box::new(err),
            }
        })
    }

    fn report_resident(&self, entries: &Entries) {
        if let Some(metrics) = &self.metrics {
            metrics.report_resident(entries.len());
        }
    }
}
