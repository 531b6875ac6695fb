//! [`DurableStore`] backed by RocksDB.

use crate::store::{DurableStore, StoreBatch, StoreOp, StoreSnapshot};
use crate::{Error, Result, UtxoEntry, UtxoKey, UtxoValue, cf, meta_keys};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, Snapshot, WriteBatch};
use std::collections::HashMap;
use std::path::Path;

/// UTXO baseline persisted in RocksDB.
///
/// Keys are [`UtxoKey::to_bytes`], so the natural iteration order of the `utxos` column family
/// is the ledger order.
pub struct RocksDbStore {
    /// RocksDB instance.
    db: DB,
    /// Total UTXO count, mirrored in the `meta` column family.
    utxo_count: RwLock<u64>,
}

impl RocksDbStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Optimize for UTXO workload
        db_opts.set_write_buffer_size(256 * 1024 * 1024); // 256MB write buffer
        db_opts.set_max_write_buffer_number(4);
        db_opts.set_target_file_size_base(256 * 1024 * 1024);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Enable bloom filters for faster lookups
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(cf::UTXOS, Options::default()),
            ColumnFamilyDescriptor::new(cf::META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let utxo_count = Self::load_utxo_count(&db)?;

        tracing::info!("Opened UTXO store at {}, {utxo_count} UTXOs", path.display());

        Ok(Self {
            db,
            utxo_count: RwLock::new(utxo_count),
        })
    }

    fn load_utxo_count(db: &DB) -> Result<u64> {
        let Some(cf) = db.cf_handle(cf::META) else {
            return Ok(0);
        };

        match db.get_cf(cf, meta_keys::UTXO_COUNT)? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::CorruptEntry(format!("invalid utxo count length {}", bytes.len()))
                })?;
                Ok(u64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }
}

impl DurableStore for RocksDbStore {
    fn write_batch(&self, batch: StoreBatch) -> Result<()> {
        let cf_utxos = self.db.cf_handle(cf::UTXOS).ok_or(Error::NotInitialized)?;
        let cf_meta = self.db.cf_handle(cf::META).ok_or(Error::NotInitialized)?;

        // Hold the count lock for the whole write so the persisted count never races.
        let mut utxo_count = self.utxo_count.write();

        // Presence of each touched key after the batch, used to keep the count exact when a
        // batch touches the same key more than once.
        let mut presence: HashMap<UtxoKey, (bool, bool)> = HashMap::new();
        let mut write_batch = WriteBatch::default();

        if let Some(block_height) = batch.committed_block_height() {
            write_batch.put_cf(
                cf_meta,
                meta_keys::COMMITTED_BLOCK_HEIGHT,
                block_height.to_le_bytes(),
            );
        }

        for op in batch.into_ops() {
            let key = match &op {
                StoreOp::Put(key, _) | StoreOp::Delete(key) => *key,
            };
            if !presence.contains_key(&key) {
                let existed = self.db.get_cf(cf_utxos, key.to_bytes())?.is_some();
                presence.insert(key, (existed, existed));
            }

            match op {
                StoreOp::Put(key, value) => {
                    write_batch.put_cf(cf_utxos, key.to_bytes(), value.encode_for_storage()?);
                    if let Some(state) = presence.get_mut(&key) {
                        state.1 = true;
                    }
                }
                StoreOp::Delete(key) => {
                    write_batch.delete_cf(cf_utxos, key.to_bytes());
                    if let Some(state) = presence.get_mut(&key) {
                        state.1 = false;
                    }
                }
            }
        }

        let (added, removed) =
            presence
                .values()
                .fold((0u64, 0u64), |(added, removed), (before, after)| {
                    match (before, after) {
                        (false, true) => (added + 1, removed),
                        (true, false) => (added, removed + 1),
                        _ => (added, removed),
                    }
                });

        let new_count = (*utxo_count + added).saturating_sub(removed);
        write_batch.put_cf(cf_meta, meta_keys::UTXO_COUNT, new_count.to_le_bytes());

        // Atomic write
        self.db.write(write_batch)?;

        *utxo_count = new_count;

        tracing::trace!("Wrote batch: +{added} -{removed} UTXOs, total: {new_count}");

        Ok(())
    }

    fn get(&self, key: &UtxoKey) -> Result<Option<UtxoValue>> {
        let cf = self.db.cf_handle(cf::UTXOS).ok_or(Error::NotInitialized)?;
        self.db
            .get_cf(cf, key.to_bytes())?
            .map(|bytes| UtxoValue::decode_from_storage(&bytes))
            .transpose()
    }

    fn len(&self) -> Result<u64> {
        Ok(*self.utxo_count.read())
    }

    fn committed_block_height(&self) -> Result<Option<u32>> {
        let cf = self.db.cf_handle(cf::META).ok_or(Error::NotInitialized)?;
        self.db
            .get_cf(cf, meta_keys::COMMITTED_BLOCK_HEIGHT)?
            .map(|bytes| {
                let bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    Error::CorruptEntry(format!(
                        "invalid committed block height length {}",
                        bytes.len()
                    ))
                })?;
                Ok(u32::from_le_bytes(bytes))
            })
            .transpose()
    }

    fn snapshot(&self) -> Result<Box<dyn StoreSnapshot + '_>> {
        if self.db.cf_handle(cf::UTXOS).is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(Box::new(RocksDbSnapshot {
            db: &self.db,
            snapshot: self.db.snapshot(),
        }))
    }
}

struct RocksDbSnapshot<'a> {
    db: &'a DB,
    snapshot: Snapshot<'a>,
}

impl StoreSnapshot for RocksDbSnapshot<'_> {
    fn entries(&self) -> Box<dyn Iterator<Item = Result<UtxoEntry>> + '_> {
        let Some(cf) = self.db.cf_handle(cf::UTXOS) else {
            return Box::new(std::iter::once(Err(Error::NotInitialized)));
        };

        Box::new(
            self.snapshot
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| {
                    let (key, value) = item?;
                    Ok(UtxoEntry::new(
                        UtxoKey::from_bytes(&key)?,
                        UtxoValue::decode_from_storage(&value)?,
                    ))
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use bitcoin::hashes::Hash;

    fn open_temp() -> (RocksDbStore, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RocksDbStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn key(byte: u8, vout: u32) -> UtxoKey {
        UtxoKey::new(Txid::from_byte_array([byte; 32]), vout)
    }

    #[test]
    fn test_write_and_read() {
        let (store, _dir) = open_temp();

        let mut batch = StoreBatch::new();
        batch.put(key(1, 0), UtxoValue::unspent(10, true, 5_000_000_000, vec![0x51]));
        batch.put(key(1, 1), UtxoValue::unspent(10, true, 1, vec![]));
        store.write_batch(batch).unwrap();

        assert_eq!(store.len().unwrap(), 2);
        let value = store.get(&key(1, 0)).unwrap().unwrap();
        assert_eq!(value.amount, 5_000_000_000);
        assert!(store.get(&key(2, 0)).unwrap().is_none());
    }

    #[test]
    fn test_count_tracks_overwrites_and_deletes() {
        let (store, _dir) = open_temp();

        let mut batch = StoreBatch::new();
        batch.put(key(1, 0), UtxoValue::unspent(1, false, 1, vec![]));
        batch.put(key(1, 0), UtxoValue::unspent(2, false, 2, vec![]));
        batch.delete(key(9, 9));
        store.write_batch(batch).unwrap();
        assert_eq!(store.len().unwrap(), 1);

        let mut batch = StoreBatch::new();
        batch.delete(key(1, 0));
        batch.put(key(2, 0), UtxoValue::unspent(3, false, 3, vec![]));
        store.write_batch(batch).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert!(!store.contains(&key(1, 0)).unwrap());
    }

    #[test]
    fn test_snapshot_iterates_in_key_order() {
        let (store, _dir) = open_temp();

        let mut batch = StoreBatch::new();
        for (byte, vout) in [(3, 0), (1, 256), (1, 2), (2, 0)] {
            batch.put(key(byte, vout), UtxoValue::unspent(1, false, 1, vec![]));
        }
        store.write_batch(batch).unwrap();

        let snapshot = store.snapshot().unwrap();
        let mut batch = StoreBatch::new();
        batch.put(key(0, 0), UtxoValue::unspent(1, false, 1, vec![]));
        store.write_batch(batch).unwrap();

        let keys = snapshot
            .entries()
            .map(|entry| entry.map(|entry| entry.key))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(keys, vec![key(1, 2), key(1, 256), key(2, 0), key(3, 0)]);
    }

    #[test]
    fn test_reopen_keeps_count() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let store = RocksDbStore::open(temp_dir.path()).unwrap();
            let mut batch = StoreBatch::new();
            batch.put(key(1, 0), UtxoValue::unspent(1, false, 1, vec![]));
            store.write_batch(batch).unwrap();
        }
        let store = RocksDbStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.committed_block_height().unwrap(), None);
    }

    #[test]
    fn test_committed_block_height_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let store = RocksDbStore::open(temp_dir.path()).unwrap();
            let mut batch = StoreBatch::new();
            batch.put(key(1, 0), UtxoValue::unspent(1, false, 1, vec![]));
            batch.set_committed_block_height(840_000);
            store.write_batch(batch).unwrap();
        }
        let store = RocksDbStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.committed_block_height().unwrap(), Some(840_000));
        assert_eq!(store.len().unwrap(), 1);
    }
}
