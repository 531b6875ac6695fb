//! Verification and import of downloaded commitments.

use crate::manifest::{EMPTY_BUCKET_NAME, SubBucket, UtxoCommitment};
use crate::{CommittedUtxo, Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Instant;
use subcoin_crypto::EcMultiset;
use subcoin_utxo_storage::{DurableStore, StoreBatch, UtxoKey};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Entries written to the durable store per batch during import.
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 10_000;

/// Accumulator and statistics of a payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileSummary {
    pub multiset: EcMultiset,
    pub utxo_count: u64,
    pub byte_count: u64,
    /// Whether the entries are in ascending key order.
    pub is_sorted: bool,
}

/// Iterator over the entries of a payload file.
pub struct PayloadReader {
    reader: Option<BufReader<File>>,
}

impl PayloadReader {
    /// Opens a payload file. A missing file named [`EMPTY_BUCKET_NAME`] reads as empty.
    pub fn open(path: &Path) -> Result<Self> {
        match File::open(path) {
            Ok(file) => Ok(Self {
                reader: Some(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
            }),
            Err(err)
                if err.kind() == ErrorKind::NotFound
                    && path
                        .file_name()
                        .is_some_and(|name| name == EMPTY_BUCKET_NAME) =>
            {
                Ok(Self { reader: None })
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Iterator for PayloadReader {
    type Item = Result<CommittedUtxo>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match CommittedUtxo::decode(reader) {
            Ok(Some(utxo)) => Some(Ok(utxo)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

/// Loads commitment payload files from a directory.
pub struct CommitmentLoader {
    dir: PathBuf,
}

impl CommitmentLoader {
    /// Constructs a new instance of [`CommitmentLoader`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Computes the accumulator of a payload file.
    ///
    /// A missing file named [`EMPTY_BUCKET_NAME`] is the empty multiset.
    pub fn summarize_file(path: &Path) -> Result<FileSummary> {
        let mut summary = FileSummary {
            is_sorted: true,
            ..Default::default()
        };
        let mut last_key: Option<UtxoKey> = None;

        for utxo in PayloadReader::open(path)? {
            let utxo = utxo?;
            if last_key.is_some_and(|last_key| utxo.key <= last_key) {
                summary.is_sorted = false;
            }
            last_key = Some(utxo.key);

            let bytes = utxo.to_bytes();
            summary.multiset.add_item(&bytes);
            summary.utxo_count += 1;
            summary.byte_count += bytes.len() as u64;
        }

        Ok(summary)
    }

    /// Checks a payload file against its manifest entry.
    pub fn verify_sub_bucket(&self, sub_bucket: &SubBucket) -> Result<FileSummary> {
        let path = self.dir.join(sub_bucket.file_name());
        let summary = Self::summarize_file(&path)?;
        let context = || path.display().to_string();

        if summary.multiset.public_key() != sub_bucket.public_key {
            return Err(Error::AccumulatorMismatch {
                context: context(),
                expected: hex::encode(sub_bucket.public_key),
                actual: hex::encode(summary.multiset.public_key()),
            });
        }
        if summary.utxo_count != sub_bucket.utxo_count {
            return Err(Error::CountMismatch {
                context: context(),
                expected: sub_bucket.utxo_count,
                actual: summary.utxo_count,
            });
        }
        if summary.byte_count != sub_bucket.byte_count {
            return Err(Error::CountMismatch {
                context: context(),
                expected: sub_bucket.byte_count,
                actual: summary.byte_count,
            });
        }
        if !summary.is_sorted {
            return Err(Error::UnsortedFile(path));
        }

        Ok(summary)
    }

    /// Verifies the manifest accumulators and every payload file of `commitment`.
    pub fn verify(&self, commitment: &UtxoCommitment) -> Result<()> {
        let now = Instant::now();

        commitment.verify_accumulators()?;
        for sub_bucket in commitment.sub_buckets() {
            self.verify_sub_bucket(sub_bucket)?;
        }

        tracing::debug!(
            "Verified UTXO commitment #{},{} in {}ms",
            commitment.block_height,
            commitment.block_hash,
            now.elapsed().as_millis()
        );

        Ok(())
    }

    /// Verifies `commitment` and writes its UTXOs into `store` in ascending key order.
    ///
    /// The payload files are merged, so the store receives one sorted stream regardless of the
    /// bucket layout. Returns the number of imported UTXOs.
    pub fn import<S: DurableStore + ?Sized>(
        &self,
        commitment: &UtxoCommitment,
        store: &S,
        batch_size: usize,
    ) -> Result<u64> {
        self.verify(commitment)?;

        let now = Instant::now();

        let mut readers = commitment
            .file_names()
            .map(|file_name| PayloadReader::open(&self.dir.join(file_name)))
            .collect::<Result<Vec<_>>>()?;

        let mut heads = Vec::with_capacity(readers.len());
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            let head = reader.next().transpose()?;
            if let Some(utxo) = &head {
                heap.push(Reverse((utxo.key, source)));
            }
            heads.push(head);
        }

        let batch_size = batch_size.max(1);
        let mut batch = StoreBatch::new();
        let mut last_key: Option<UtxoKey> = None;
        let mut imported = 0u64;

        while let Some(Reverse((key, source))) = heap.pop() {
            let Some(utxo) = heads[source].take() else {
                continue;
            };

            if last_key.is_some_and(|last_key| key <= last_key) {
                return Err(Error::MalformedEntry(format!(
                    "UTXO {key} appears more than once"
                )));
            }
            last_key = Some(key);

            let entry = utxo.into_entry()?;
            batch.put(entry.key, entry.value);
            imported += 1;

            if batch.len() >= batch_size {
                store.write_batch(std::mem::take(&mut batch))?;
            }

            if let Some(next) = readers[source].next().transpose()? {
                heap.push(Reverse((next.key, source)));
                heads[source] = Some(next);
            }
        }

        if !batch.is_empty() {
            store.write_batch(batch)?;
        }

        tracing::info!(
            "Imported {imported} UTXOs from commitment #{},{} in {}ms",
            commitment.block_height,
            commitment.block_hash,
            now.elapsed().as_millis()
        );

        Ok(imported)
    }
}
