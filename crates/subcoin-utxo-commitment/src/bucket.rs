use crate::manifest::{BUCKET_COUNT, Bucket, SubBucket};
use crate::{CommittedUtxo, Result};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use subcoin_crypto::EcMultiset;
use subcoin_utxo_storage::UtxoKey;

/// Default bound on the size of a payload file.
pub const MAX_SUB_BUCKET_BYTES: u64 = 32 * 1024 * 1024;

const PAGE_SIZE: usize = 16 * 1024;

/// Returns the bucket of `key` in the commitment at `block_hash`.
///
/// Salting with the block hash changes the distribution at every commitment.
pub fn bucket_index(block_hash: &BlockHash, key: &UtxoKey) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(block_hash.as_byte_array());
    hasher.update(key.txid.as_byte_array());
    hasher.update(key.vout.to_le_bytes());
    let digest = hasher.finalize();
    (digest[0] as usize) & (BUCKET_COUNT - 1)
}

static NEXT_BUILD_ID: AtomicU64 = AtomicU64::new(0);

/// Files created by a single build, so that a failed build can remove them.
pub(crate) struct BuildFiles {
    id: u64,
    created: Mutex<Vec<PathBuf>>,
}

impl BuildFiles {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_BUILD_ID.fetch_add(1, Ordering::Relaxed),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Name of the staging file of `bucket`, unique across builds running concurrently in this
    /// or another process.
    fn staging_name(&self, bucket: u32) -> String {
        format!("utxo-{}-{}-{bucket}.staging", std::process::id(), self.id)
    }

    fn record(&self, path: PathBuf) {
        self.created.lock().push(path);
    }

    /// Deletes every recorded file, returning how many were removed.
    pub(crate) fn remove_all(&self) -> usize {
        let mut removed = 0;
        for path in self.created.lock().drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!("Failed to remove {}: {err}", path.display());
                }
            }
        }
        removed
    }
}

struct OpenSubBucket {
    writer: BufWriter<File>,
    multiset: EcMultiset,
    utxo_count: u64,
    byte_count: u64,
}

/// Writes the payload files of one bucket, splitting them at the byte bound.
pub(crate) struct BucketWriter<'a> {
    index: u32,
    output_dir: PathBuf,
    files: &'a BuildFiles,
    max_sub_bucket_bytes: u64,
    current: Option<OpenSubBucket>,
    multiset: EcMultiset,
    sub_buckets: Vec<SubBucket>,
}

impl<'a> BucketWriter<'a> {
    pub(crate) fn new(
        index: u32,
        output_dir: &Path,
        max_sub_bucket_bytes: u64,
        files: &'a BuildFiles,
    ) -> Self {
        Self {
            index,
            output_dir: output_dir.to_path_buf(),
            files,
            max_sub_bucket_bytes,
            current: None,
            multiset: EcMultiset::new(),
            sub_buckets: Vec::new(),
        }
    }

    /// File receiving the entries of the open sub-bucket, renamed once its key is known.
    fn staging_path(&self) -> PathBuf {
        self.output_dir.join(self.files.staging_name(self.index))
    }

    pub(crate) fn add(&mut self, utxo: &CommittedUtxo) -> Result<()> {
        let bytes = utxo.to_bytes();
        let len = bytes.len() as u64;

        let needs_split = self.current.as_ref().is_some_and(|current| {
            current.utxo_count > 0 && current.byte_count + len > self.max_sub_bucket_bytes
        });
        if needs_split {
            self.close_sub_bucket()?;
        }

        if self.current.is_none() {
            let staging_path = self.staging_path();
            let file = File::create(&staging_path)?;
            self.files.record(staging_path);
            self.current = Some(OpenSubBucket {
                writer: BufWriter::with_capacity(PAGE_SIZE, file),
                multiset: EcMultiset::new(),
                utxo_count: 0,
                byte_count: 0,
            });
        }

        if let Some(current) = self.current.as_mut() {
            current.writer.write_all(&bytes)?;
            current.multiset.add_item(&bytes);
            current.utxo_count += 1;
            current.byte_count += len;
        }

        Ok(())
    }

    fn close_sub_bucket(&mut self) -> Result<()> {
        let Some(OpenSubBucket {
            mut writer,
            multiset,
            utxo_count,
            byte_count,
        }) = self.current.take()
        else {
            return Ok(());
        };

        writer.flush()?;
        drop(writer);

        let sub_bucket = SubBucket {
            index: self.sub_buckets.len() as u32,
            public_key: multiset.public_key(),
            utxo_count,
            byte_count,
        };
        let path = self.output_dir.join(sub_bucket.file_name());
        // Files with the same content may already belong to another commitment.
        let existed = path.exists();
        fs::rename(self.staging_path(), &path)?;
        if !existed {
            self.files.record(path.clone());
        }

        tracing::trace!(
            "Sub-bucket {}/{} written to {}: {byte_count} bytes, {utxo_count} UTXOs",
            self.index,
            sub_bucket.index,
            path.display()
        );

        self.multiset.merge(&multiset);
        self.sub_buckets.push(sub_bucket);

        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<Bucket> {
        self.close_sub_bucket()?;

        if self.sub_buckets.is_empty() {
            self.sub_buckets.push(SubBucket::empty());
        }

        Ok(Bucket {
            index: self.index,
            public_key: self.multiset.public_key(),
            sub_buckets: self.sub_buckets,
        })
    }
}
