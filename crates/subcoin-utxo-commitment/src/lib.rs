//! UTXO commitments.
//!
//! A commitment is a three-level hierarchy of [`EcMultiset`](subcoin_crypto::EcMultiset)
//! accumulators over the serialized UTXO set at a block:
//!
//! - the UTXOs are split into [`BUCKET_COUNT`] buckets by a hash of the block hash and the
//!   outpoint;
//! - each bucket is written as one or more payload files (sub-buckets) of at most
//!   [`MAX_SUB_BUCKET_BYTES`], each with its own accumulator;
//! - bucket accumulators merge their sub-buckets, the commitment merges all buckets.
//!
//! Peers can therefore download and verify payload files independently and in parallel.

mod bucket;
mod builder;
mod error;
mod loader;
mod manifest;
mod manifest_store;
mod scheduler;
mod serialize;

pub use self::bucket::{MAX_SUB_BUCKET_BYTES, bucket_index};
pub use self::builder::{CommitmentParams, UtxoCommitmentBuilder};
pub use self::error::Error;
pub use self::loader::{CommitmentLoader, DEFAULT_IMPORT_BATCH_SIZE, FileSummary, PayloadReader};
pub use self::manifest::{BUCKET_COUNT, Bucket, EMPTY_BUCKET_NAME, SubBucket, UtxoCommitment};
pub use self::manifest_store::{
    DEFAULT_COMMITMENTS_TO_KEEP, InMemoryManifestStore, JsonManifestStore, ManifestStore,
    require_commitment,
};
pub use self::scheduler::{
    CommitmentScheduler, DEFAULT_BLOCK_LAG, DEFAULT_PUBLISH_INTERVAL, SchedulerOptions,
};
pub use self::serialize::{CommittedUtxo, read_compact_size, write_compact_size};

pub type Result<T> = std::result::Result<T, Error>;
