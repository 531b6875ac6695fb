//! Persistence of commitment manifests.

use crate::manifest::UtxoCommitment;
use crate::{Error, Result};
use bitcoin::BlockHash;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Default number of commitments kept by [`ManifestStore::prune`].
pub const DEFAULT_COMMITMENTS_TO_KEEP: usize = 2;

/// Most recent first: descending height, then ascending block hash.
fn sort_most_recent_first(commitments: &mut [UtxoCommitment]) {
    commitments.sort_by(|a, b| {
        b.block_height
            .cmp(&a.block_height)
            .then_with(|| a.block_hash.cmp(&b.block_hash))
    });
}

/// Storage of commitment manifests, keyed by block hash.
pub trait ManifestStore: Send + Sync {
    /// Inserts or replaces the manifest of `commitment.block_hash`.
    fn put(&self, commitment: UtxoCommitment) -> Result<()>;

    fn get(&self, block_hash: &BlockHash) -> Result<Option<UtxoCommitment>>;

    /// All manifests, most recent first.
    fn list(&self) -> Result<Vec<UtxoCommitment>>;

    /// Removes a manifest, returning whether it existed.
    fn remove(&self, block_hash: &BlockHash) -> Result<bool>;

    fn latest(&self) -> Result<Option<UtxoCommitment>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Stores a manifest received from a peer.
    ///
    /// Bucket public keys are recomputed from the sub-buckets and must add up to the declared
    /// top-level accumulator, otherwise [`Error::AccumulatorMismatch`] is returned and nothing
    /// is stored.
    fn store_downloaded(&self, mut commitment: UtxoCommitment) -> Result<UtxoCommitment> {
        commitment.rebuild_accumulators()?;
        self.put(commitment.clone())?;
        tracing::debug!(
            "Stored downloaded UTXO commitment #{},{}",
            commitment.block_height,
            commitment.block_hash
        );
        Ok(commitment)
    }

    /// Keeps the `keep` most recent manifests and deletes the others along with their payload
    /// files under `data_dir`, except files still referenced by a kept manifest.
    ///
    /// Returns the block hashes of the removed manifests.
    fn prune(&self, keep: usize, data_dir: &Path) -> Result<Vec<BlockHash>> {
        let commitments = self.list()?;
        if commitments.len() <= keep {
            return Ok(Vec::new());
        }

        let (kept, removed) = commitments.split_at(keep);
        let referenced = kept
            .iter()
            .flat_map(UtxoCommitment::file_names)
            .collect::<HashSet<_>>();

        let mut removed_hashes = Vec::with_capacity(removed.len());
        for commitment in removed {
            for file_name in commitment.file_names() {
                if referenced.contains(&file_name) {
                    continue;
                }
                match fs::remove_file(data_dir.join(&file_name)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            self.remove(&commitment.block_hash)?;
            tracing::debug!(
                "Pruned UTXO commitment #{},{}",
                commitment.block_height,
                commitment.block_hash
            );
            removed_hashes.push(commitment.block_hash);
        }

        Ok(removed_hashes)
    }
}

/// [`ManifestStore`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    commitments: RwLock<HashMap<BlockHash, UtxoCommitment>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for InMemoryManifestStore {
    fn put(&self, commitment: UtxoCommitment) -> Result<()> {
        self.commitments
            .write()
            .insert(commitment.block_hash, commitment);
        Ok(())
    }

    fn get(&self, block_hash: &BlockHash) -> Result<Option<UtxoCommitment>> {
        Ok(self.commitments.read().get(block_hash).cloned())
    }

    fn list(&self) -> Result<Vec<UtxoCommitment>> {
        let mut commitments = self.commitments.read().values().cloned().collect::<Vec<_>>();
        sort_most_recent_first(&mut commitments);
        Ok(commitments)
    }

    fn remove(&self, block_hash: &BlockHash) -> Result<bool> {
        Ok(self.commitments.write().remove(block_hash).is_some())
    }
}

/// [`ManifestStore`] writing one `<block_hash>.json` file per manifest.
#[derive(Debug)]
pub struct JsonManifestStore {
    dir: PathBuf,
}

impl JsonManifestStore {
    const EXTENSION: &'static str = "json";

    /// Opens the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, block_hash: &BlockHash) -> PathBuf {
        self.dir.join(format!("{block_hash}.{}", Self::EXTENSION))
    }

    /// Reads a manifest file written by [`JsonManifestStore`] or any tool using the same
    /// format.
    pub fn read_manifest(path: &Path) -> Result<UtxoCommitment> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl ManifestStore for JsonManifestStore {
    fn put(&self, commitment: UtxoCommitment) -> Result<()> {
        let path = self.manifest_path(&commitment.block_hash);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&commitment)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn get(&self, block_hash: &BlockHash) -> Result<Option<UtxoCommitment>> {
        match fs::read(self.manifest_path(block_hash)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<UtxoCommitment>> {
        let mut commitments = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|ext| ext == Self::EXTENSION) {
                commitments.push(Self::read_manifest(&path)?);
            }
        }
        sort_most_recent_first(&mut commitments);
        Ok(commitments)
    }

    fn remove(&self, block_hash: &BlockHash) -> Result<bool> {
        match fs::remove_file(self.manifest_path(block_hash)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Looks up a manifest, failing with [`Error::NotFound`] if it is unknown.
pub fn require_commitment<M: ManifestStore + ?Sized>(
    store: &M,
    block_hash: &BlockHash,
) -> Result<UtxoCommitment> {
    store.get(block_hash)?.ok_or(Error::NotFound(*block_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{BUCKET_COUNT, Bucket, SubBucket};
    use bitcoin::hashes::Hash;
    use subcoin_crypto::{EMPTY_HASH, EMPTY_PUBLIC_KEY, EcMultiset};

    fn commitment(height: u32, payloads: &[&str]) -> UtxoCommitment {
        let mut sub_buckets = payloads
            .iter()
            .enumerate()
            .map(|(index, payload)| {
                let mut multiset = EcMultiset::new();
                multiset.add_item(payload.as_bytes());
                SubBucket {
                    index: index as u32,
                    public_key: multiset.public_key(),
                    utxo_count: 1,
                    byte_count: payload.len() as u64,
                }
            })
            .collect::<Vec<_>>();
        if sub_buckets.is_empty() {
            sub_buckets.push(SubBucket::empty());
        }

        let mut buckets = (0..BUCKET_COUNT as u32)
            .map(|index| Bucket {
                index,
                public_key: EMPTY_PUBLIC_KEY,
                sub_buckets: vec![SubBucket::empty()],
            })
            .collect::<Vec<_>>();
        buckets[0].sub_buckets = sub_buckets;

        let mut commitment = UtxoCommitment {
            block_hash: BlockHash::from_byte_array([height as u8; 32]),
            block_height: height,
            hash: EMPTY_HASH,
            public_key: EMPTY_PUBLIC_KEY,
            byte_count: payloads.iter().map(|p| p.len() as u64).sum(),
            buckets,
        };
        let multiset = commitment.buckets[0].compute_multiset().unwrap();
        commitment.buckets[0].public_key = multiset.public_key();
        commitment.hash = multiset.hash();
        commitment.public_key = multiset.public_key();
        commitment
    }

    fn check_store(store: &dyn ManifestStore) {
        assert!(store.latest().unwrap().is_none());

        store.put(commitment(20, &["b"])).unwrap();
        store.put(commitment(10, &["a"])).unwrap();
        store.put(commitment(30, &["c"])).unwrap();

        let heights = store
            .list()
            .unwrap()
            .iter()
            .map(|c| c.block_height)
            .collect::<Vec<_>>();
        assert_eq!(heights, vec![30, 20, 10]);
        assert_eq!(store.latest().unwrap().unwrap().block_height, 30);

        let block_hash = BlockHash::from_byte_array([20; 32]);
        assert_eq!(store.get(&block_hash).unwrap().unwrap().block_height, 20);
        assert!(store.remove(&block_hash).unwrap());
        assert!(!store.remove(&block_hash).unwrap());
        assert!(store.get(&block_hash).unwrap().is_none());
        assert!(matches!(
            require_commitment(store, &block_hash),
            Err(Error::NotFound(hash)) if hash == block_hash
        ));
    }

    #[test]
    fn test_in_memory_store() {
        check_store(&InMemoryManifestStore::new());
    }

    #[test]
    fn test_json_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonManifestStore::open(temp_dir.path().join("manifests")).unwrap();
        check_store(&store);

        // Survives reopening.
        let reopened = JsonManifestStore::open(store.dir()).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 2);
    }

    #[test]
    fn test_store_downloaded_rebuilds_bucket_keys() {
        let store = InMemoryManifestStore::new();
        let mut downloaded = commitment(5, &["x", "y"]);
        let expected = downloaded.buckets[0].public_key;
        downloaded.buckets[0].public_key = EMPTY_PUBLIC_KEY;

        let stored = store.store_downloaded(downloaded).unwrap();
        assert_eq!(stored.buckets[0].public_key, expected);
        assert_eq!(store.get(&stored.block_hash).unwrap().unwrap(), stored);
    }

    #[test]
    fn test_store_downloaded_rejects_inconsistent_manifest() {
        let store = InMemoryManifestStore::new();
        let mut downloaded = commitment(5, &["x", "y"]);
        downloaded.buckets[0].sub_buckets.pop();

        assert!(matches!(
            store.store_downloaded(downloaded),
            Err(Error::AccumulatorMismatch { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = InMemoryManifestStore::new();

        // Heights 10 and 20 share the payload "shared".
        let commitments = [
            commitment(10, &["old", "shared"]),
            commitment(20, &["shared"]),
            commitment(30, &["new"]),
        ];
        for commitment in &commitments {
            for file_name in commitment.file_names() {
                fs::write(temp_dir.path().join(file_name), "payload").unwrap();
            }
            store.put(commitment.clone()).unwrap();
        }

        let removed = store
            .prune(DEFAULT_COMMITMENTS_TO_KEEP, temp_dir.path())
            .unwrap();
        assert_eq!(removed, vec![commitments[0].block_hash]);

        let heights = store
            .list()
            .unwrap()
            .iter()
            .map(|c| c.block_height)
            .collect::<Vec<_>>();
        assert_eq!(heights, vec![30, 20]);

        let exists = |commitment: &UtxoCommitment, sub: usize| {
            let name = commitment.buckets[0].sub_buckets[sub].file_name();
            temp_dir.path().join(name).exists()
        };
        assert!(!exists(&commitments[0], 0));
        assert!(exists(&commitments[0], 1));
        assert!(exists(&commitments[2], 0));

        assert!(store.prune(2, temp_dir.path()).unwrap().is_empty());
    }
}
