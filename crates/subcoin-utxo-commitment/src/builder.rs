//! Commitment generation.
//!
//! The source entries are scanned once, in key order, on the calling thread. Each entry is
//! routed to the worker owning its bucket; workers own a contiguous range of buckets and write
//! their payload files independently. Per-bucket order therefore follows the scan order, which
//! keeps every payload file sorted.
//!
//! A build that fails or is cancelled removes the files it created before returning.

use crate::bucket::{BucketWriter, BuildFiles, MAX_SUB_BUCKET_BYTES, bucket_index};
use crate::manifest::{BUCKET_COUNT, Bucket, UtxoCommitment};
use crate::manifest_store::ManifestStore;
use crate::{CommittedUtxo, Error, Result};
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::time::Instant;
use subcoin_crypto::EcMultiset;
use subcoin_utxo_storage::{LedgerSnapshot, UtxoEntry, UtxoKey};

/// Entries sent to a worker at once.
const BATCH_SIZE: usize = 1024;

/// Batches buffered per worker before the scan blocks.
const CHANNEL_DEPTH: usize = 16;

type Batch = Vec<(usize, CommittedUtxo)>;

/// Commitment generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommitmentParams {
    /// Maximum size of a payload file, unless a single entry is larger.
    pub max_sub_bucket_bytes: u64,
    /// Number of bucket writer threads.
    pub worker_count: usize,
}

impl Default for CommitmentParams {
    fn default() -> Self {
        Self {
            max_sub_bucket_bytes: MAX_SUB_BUCKET_BYTES,
            worker_count: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

/// Splits the buckets into `worker_count` contiguous ranges, the last one taking the remainder.
fn bucket_ranges(worker_count: usize) -> Vec<Range<usize>> {
    let worker_count = worker_count.clamp(1, BUCKET_COUNT);
    let per_worker = BUCKET_COUNT / worker_count;
    (0..worker_count)
        .map(|worker| {
            let start = worker * per_worker;
            let end = if worker + 1 == worker_count {
                BUCKET_COUNT
            } else {
                start + per_worker
            };
            start..end
        })
        .collect()
}

/// Builds UTXO commitments into a directory of payload files.
pub struct UtxoCommitmentBuilder {
    output_dir: PathBuf,
    params: CommitmentParams,
    cancel: Arc<AtomicBool>,
}

impl UtxoCommitmentBuilder {
    /// Constructs a new instance of [`UtxoCommitmentBuilder`].
    pub fn new(output_dir: impl Into<PathBuf>, params: CommitmentParams) -> Self {
        Self {
            output_dir: output_dir.into(),
            params,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn params(&self) -> &CommitmentParams {
        &self.params
    }

    /// Flag aborting an ongoing build with [`Error::Cancelled`] once set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Builds the commitment of the ledger captured by `snapshot`.
    pub fn build_from_snapshot(
        &self,
        block_hash: BlockHash,
        block_height: u32,
        snapshot: &LedgerSnapshot<'_>,
    ) -> Result<UtxoCommitment> {
        self.build(block_hash, block_height, snapshot.entries())
    }

    /// Builds the commitment and stores its manifest.
    pub fn build_and_store<M: ManifestStore + ?Sized>(
        &self,
        manifest_store: &M,
        block_hash: BlockHash,
        block_height: u32,
        snapshot: &LedgerSnapshot<'_>,
    ) -> Result<UtxoCommitment> {
        let commitment = self.build_from_snapshot(block_hash, block_height, snapshot)?;
        manifest_store.put(commitment.clone())?;
        Ok(commitment)
    }

    /// Builds the commitment of `entries`, which must be in ascending key order.
    ///
    /// Spent entries and entries without a positive amount are skipped.
    pub fn build<I>(
        &self,
        block_hash: BlockHash,
        block_height: u32,
        entries: I,
    ) -> Result<UtxoCommitment>
    where
        I: IntoIterator<Item = subcoin_utxo_storage::Result<UtxoEntry>>,
    {
        std::fs::create_dir_all(&self.output_dir)?;

        let files = BuildFiles::new();
        self.build_inner(block_hash, block_height, entries, &files)
            .inspect_err(|err| {
                let removed = files.remove_all();
                tracing::debug!(
                    "UTXO commitment #{block_height},{block_hash} failed ({err}), removed {removed} files"
                );
            })
    }

    fn build_inner<I>(
        &self,
        block_hash: BlockHash,
        block_height: u32,
        entries: I,
        files: &BuildFiles,
    ) -> Result<UtxoCommitment>
    where
        I: IntoIterator<Item = subcoin_utxo_storage::Result<UtxoEntry>>,
    {
        let now = Instant::now();

        let ranges = bucket_ranges(self.params.worker_count);

        let (scanned, mut buckets) = std::thread::scope(|scope| {
            let mut senders = Vec::with_capacity(ranges.len());
            let mut workers = Vec::with_capacity(ranges.len());

            for range in &ranges {
                let (sender, receiver) = sync_channel::<Batch>(CHANNEL_DEPTH);
                senders.push(sender);
                let range = range.clone();
                workers.push(scope.spawn(move || self.write_buckets(range, receiver, files)));
            }

            let scanned = self.dispatch(block_hash, entries, &ranges, senders);

            let mut buckets = Vec::with_capacity(BUCKET_COUNT);
            let mut worker_error = None;
            for worker in workers {
                match worker.join() {
                    Ok(Ok(written)) => buckets.extend(written),
                    Ok(Err(err)) => {
                        worker_error.get_or_insert(err);
                    }
                    Err(_) => {
                        worker_error.get_or_insert(Error::WorkerPanicked);
                    }
                }
            }

            // A failed worker disconnects its channel, which also stops the scan.
            match worker_error {
                Some(err) => Err(err),
                None => scanned.map(|scanned| (scanned, buckets)),
            }
        })?;

        buckets.sort_by_key(|bucket| bucket.index);

        let mut multiset = EcMultiset::new();
        for bucket in &buckets {
            multiset.add_public_key(&bucket.public_key)?;
        }

        let commitment = UtxoCommitment {
            block_hash,
            block_height,
            hash: multiset.hash(),
            public_key: multiset.public_key(),
            byte_count: buckets.iter().map(Bucket::byte_count).sum(),
            buckets,
        };

        tracing::info!(
            "Built UTXO commitment #{block_height},{block_hash}: {} UTXOs ({scanned} scanned), {} bytes, hash {} in {}ms",
            commitment.utxo_count(),
            commitment.byte_count,
            hex::encode(commitment.hash),
            now.elapsed().as_millis()
        );

        Ok(commitment)
    }

    /// Routes the source entries to the workers, returning the number of entries scanned.
    fn dispatch<I>(
        &self,
        block_hash: BlockHash,
        entries: I,
        ranges: &[Range<usize>],
        senders: Vec<SyncSender<Batch>>,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = subcoin_utxo_storage::Result<UtxoEntry>>,
    {
        let mut worker_of_bucket = [0usize; BUCKET_COUNT];
        for (worker, range) in ranges.iter().enumerate() {
            for bucket in range.clone() {
                worker_of_bucket[bucket] = worker;
            }
        }

        let mut pending: Vec<Batch> = vec![Vec::with_capacity(BATCH_SIZE); senders.len()];
        let mut last_key: Option<UtxoKey> = None;
        let mut scanned = 0u64;

        for entry in entries {
            let entry = entry?;

            if last_key.is_some_and(|last_key| entry.key <= last_key) {
                return Err(Error::UnsortedInput(entry.key));
            }
            last_key = Some(entry.key);
            scanned += 1;

            let Some(utxo) = CommittedUtxo::from_entry(entry) else {
                continue;
            };

            let bucket = bucket_index(&block_hash, &utxo.key);
            let worker = worker_of_bucket[bucket];
            pending[worker].push((bucket, utxo));

            if pending[worker].len() >= BATCH_SIZE {
                if self.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let batch = std::mem::replace(&mut pending[worker], Vec::with_capacity(BATCH_SIZE));
                if senders[worker].send(batch).is_err() {
                    // The worker failed, its error is reported on join.
                    return Ok(scanned);
                }
            }
        }

        for (sender, batch) in senders.iter().zip(pending) {
            if !batch.is_empty() && sender.send(batch).is_err() {
                break;
            }
        }

        Ok(scanned)
    }

    fn write_buckets(
        &self,
        range: Range<usize>,
        receiver: Receiver<Batch>,
        files: &BuildFiles,
    ) -> Result<Vec<Bucket>> {
        let first = range.start;
        let mut writers = range
            .map(|index| {
                BucketWriter::new(
                    index as u32,
                    &self.output_dir,
                    self.params.max_sub_bucket_bytes,
                    files,
                )
            })
            .collect::<Vec<_>>();

        // Ends once the scan drops the sender.
        for batch in receiver {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            for (bucket, utxo) in batch {
                writers[bucket - first].add(&utxo)?;
            }
        }

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        writers.into_iter().map(BucketWriter::finish).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ranges() {
        assert_eq!(bucket_ranges(1), vec![0..128]);
        assert_eq!(bucket_ranges(0), vec![0..128]);
        assert_eq!(bucket_ranges(3), vec![0..42, 42..84, 84..128]);
        assert_eq!(bucket_ranges(1000).len(), BUCKET_COUNT);
    }
}
