use bitcoin::Txid;
use bitcoin::hashes::Hash;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use subcoin_utxo_storage::{
    BlockUndo, CreatedOutput, DurableStore, MemoryStore, UtxoEntry, UtxoKey, UtxoWorkingSet,
    WorkingSetOptions,
};

fn random_key(rng: &mut fastrand::Rng) -> UtxoKey {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    UtxoKey::new(Txid::from_byte_array(bytes), rng.u32(0..4))
}

fn random_output(rng: &mut fastrand::Rng) -> CreatedOutput {
    CreatedOutput {
        key: random_key(rng),
        is_coinbase: rng.bool(),
        amount: rng.u64(1..100_000_000),
        locking_script: (0..rng.usize(0..40)).map(|_| rng.u8(..)).collect(),
    }
}

/// Every output created and not spent stays retrievable with its exact value regardless of how
/// often the working set is flushed.
#[test]
fn unspent_outputs_survive_eviction() {
    let mut rng = fastrand::Rng::with_seed(7);
    let working_set = UtxoWorkingSet::new(
        Arc::new(MemoryStore::new()),
        WorkingSetOptions::new().with_max_utxo_count(64),
    );

    // Model of the expected unspent set: key -> (height, amount).
    let mut model = BTreeMap::new();

    for height in 1..=200u32 {
        let spend_count = rng.usize(0..4).min(model.len());
        let spent = (0..spend_count)
            .filter_map(|_| {
                let index = rng.usize(0..model.len());
                model.keys().nth(index).copied()
            })
            .collect::<Vec<UtxoKey>>();
        for key in &spent {
            model.remove(key);
        }
        let mut unique_spent = spent.clone();
        unique_spent.sort();
        unique_spent.dedup();
        working_set.mark_spent(&unique_spent, height);

        let outputs = (0..rng.usize(1..6))
            .map(|_| random_output(&mut rng))
            .collect::<Vec<_>>();
        for output in &outputs {
            model.insert(output.key, (height, output.amount as i64));
        }
        working_set.insert_unspent_outputs(outputs, height).unwrap();

        if height % 25 == 0 {
            working_set.commit_unspent_transaction_outputs(height).unwrap();
            assert!(working_set.len() <= working_set.options().resident_target());
        }

        assert!(working_set.len() < working_set.max_utxo_count());
    }

    for (key, (height, amount)) in &model {
        let value = working_set
            .get_unspent_output(key)
            .unwrap()
            .unwrap_or_else(|| panic!("{key} missing"));
        assert_eq!(value.block_height, *height);
        assert_eq!(value.amount, *amount);
    }

    let snapshot = working_set.snapshot().unwrap();
    let keys = snapshot
        .entries()
        .map(|entry| entry.map(|entry| entry.key))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
}

/// Outputs stay visible to concurrent readers while they move from memory to the durable store.
#[test]
fn concurrent_reads_see_unspent_outputs() {
    let mut rng = fastrand::Rng::with_seed(5);
    let working_set = UtxoWorkingSet::new(
        Arc::new(MemoryStore::new()),
        WorkingSetOptions::new().with_max_utxo_count(32),
    );

    let watched = (0..8).map(|_| random_output(&mut rng)).collect::<Vec<_>>();
    let watched_keys = watched.iter().map(|output| output.key).collect::<Vec<_>>();
    working_set.insert_unspent_outputs(watched, 1).unwrap();

    let blocks = (2..=120u32)
        .map(|height| {
            let outputs = (0..7).map(|_| random_output(&mut rng)).collect::<Vec<_>>();
            (height, outputs)
        })
        .collect::<Vec<_>>();

    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let readers = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    let mut reads = 0usize;
                    while !done.load(Ordering::Acquire) {
                        for key in &watched_keys {
                            let value = working_set.get_unspent_output(key).unwrap();
                            assert!(value.is_some(), "{key} missing");
                            reads += 1;
                        }
                    }
                    reads
                })
            })
            .collect::<Vec<_>>();

        for (height, outputs) in blocks {
            working_set.insert_unspent_outputs(outputs, height).unwrap();
            if height % 10 == 0 {
                working_set.commit_unspent_transaction_outputs(height).unwrap();
            }
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    });

    for key in &watched_keys {
        assert!(working_set.resident_entry(key).is_none());
        assert!(working_set.store().contains(key).unwrap());
    }
}

#[test]
fn reverting_blocks_restores_previous_state() {
    let mut rng = fastrand::Rng::with_seed(11);
    let working_set = UtxoWorkingSet::new(
        Arc::new(MemoryStore::new()),
        WorkingSetOptions::new().with_max_utxo_count(16),
    );

    let genesis_outputs = (0..12).map(|_| random_output(&mut rng)).collect::<Vec<_>>();
    let genesis_keys = genesis_outputs.iter().map(|o| o.key).collect::<Vec<_>>();
    working_set
        .insert_unspent_outputs(genesis_outputs, 1)
        .unwrap();
    working_set.commit_unspent_transaction_outputs(1).unwrap();

    let before = working_set
        .snapshot()
        .unwrap()
        .entries()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    let mut undos = Vec::new();
    for height in 2..=4u32 {
        let mut undo = BlockUndo::new();
        let spent_key = genesis_keys[height as usize];
        let spent_value = working_set.get_unspent_output(&spent_key).unwrap().unwrap();
        working_set.mark_spent(&[spent_key], height);
        undo.record_spend(UtxoEntry::new(spent_key, spent_value));

        let outputs = (0..5).map(|_| random_output(&mut rng)).collect::<Vec<_>>();
        for output in &outputs {
            undo.record_create(output.key);
        }
        working_set.insert_unspent_outputs(outputs, height).unwrap();
        undos.push(undo);
    }

    for undo in undos.iter().rev() {
        working_set.revert_block(undo).unwrap();
    }
    working_set.commit_unspent_transaction_outputs(1).unwrap();

    let after = working_set
        .snapshot()
        .unwrap()
        .entries()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    let strip = |entries: Vec<UtxoEntry>| {
        entries
            .into_iter()
            .map(|entry| {
                (
                    entry.key,
                    entry.value.block_height,
                    entry.value.amount,
                    entry.value.locking_script,
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(before), strip(after));
}

#[cfg(feature = "rocksdb")]
#[test]
fn eviction_persists_to_rocksdb() {
    use subcoin_utxo_storage::RocksDbStore;

    let temp_dir = tempfile::tempdir().unwrap();
    let mut rng = fastrand::Rng::with_seed(3);

    let keys = {
        let store = Arc::new(RocksDbStore::open(temp_dir.path()).unwrap());
        let working_set =
            UtxoWorkingSet::new(store.clone(), WorkingSetOptions::new().with_max_utxo_count(32));

        let mut keys = Vec::new();
        for height in 0..4u32 {
            let outputs = (0..8).map(|_| random_output(&mut rng)).collect::<Vec<_>>();
            keys.extend(outputs.iter().map(|output| output.key));
            working_set.insert_unspent_outputs(outputs, height).unwrap();
        }

        assert_eq!(working_set.len(), 16);
        assert_eq!(store.len().unwrap(), 16);

        working_set.commit_unspent_transaction_outputs(3).unwrap();
        assert_eq!(working_set.len(), 16);
        assert_eq!(store.len().unwrap(), 32);
        keys
    };

    let store = RocksDbStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.len().unwrap(), 32);
    assert_eq!(store.committed_block_height().unwrap(), Some(3));
    assert!(keys.iter().all(|key| store.contains(key).unwrap()));
}
