//! Decides at which heights commitments are published.

use crate::Result;
use crate::builder::UtxoCommitmentBuilder;
use crate::manifest::UtxoCommitment;
use crate::manifest_store::{DEFAULT_COMMITMENTS_TO_KEEP, ManifestStore};
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use subcoin_utxo_storage::{DurableStore, UtxoWorkingSet};

/// Blocks between two published commitments.
pub const DEFAULT_PUBLISH_INTERVAL: u32 = 10_000;

/// Depth a block must reach before its commitment is built.
pub const DEFAULT_BLOCK_LAG: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerOptions {
    pub publish_interval: u32,
    /// No commitment is published below this height.
    pub min_block_height: u32,
    /// Number of most recent commitments kept around.
    pub commitments_to_keep: usize,
    pub block_lag: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            min_block_height: 0,
            commitments_to_keep: DEFAULT_COMMITMENTS_TO_KEEP,
            block_lag: DEFAULT_BLOCK_LAG,
        }
    }
}

/// Schedules commitment generation while the chain is being processed.
pub struct CommitmentScheduler {
    options: SchedulerOptions,
}

impl CommitmentScheduler {
    /// Constructs a new instance of [`CommitmentScheduler`].
    pub fn new(options: SchedulerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Returns `true` if a commitment must be built for the block at `block_height`, given the
    /// current best header height.
    ///
    /// Only interval heights buried by at least `block_lag` blocks qualify, and during initial
    /// sync only the last `commitments_to_keep` of them.
    pub fn should_publish(&self, block_height: u32, best_header_height: u32) -> bool {
        let SchedulerOptions {
            publish_interval,
            min_block_height,
            commitments_to_keep,
            block_lag,
        } = self.options;

        if publish_interval == 0
            || block_height < min_block_height
            || block_height % publish_interval != 0
        {
            return false;
        }

        if block_height.saturating_add(block_lag) > best_header_height {
            return false;
        }

        let window = (commitments_to_keep as u64).saturating_mul(publish_interval as u64);
        (block_height as u64) + window > best_header_height as u64
    }

    /// Smallest interval height strictly above `block_height` that is not below the minimum.
    pub fn next_publish_height(&self, block_height: u32) -> Option<u32> {
        let interval = self.options.publish_interval;
        if interval == 0 {
            return None;
        }
        let next = (block_height / interval).checked_add(1)?.checked_mul(interval)?;
        if next >= self.options.min_block_height {
            return Some(next);
        }
        self.options
            .min_block_height
            .div_ceil(interval)
            .checked_mul(interval)
    }

    /// Builds, stores and prunes commitments for the block at `block_height` if scheduled.
    ///
    /// Must be called while the working set reflects the state right after `block_height`.
    pub fn maybe_publish<S, M>(
        &self,
        working_set: &UtxoWorkingSet<S>,
        builder: &UtxoCommitmentBuilder,
        manifest_store: &M,
        block_hash: BlockHash,
        block_height: u32,
        best_header_height: u32,
    ) -> Result<Option<UtxoCommitment>>
    where
        S: DurableStore,
        M: ManifestStore + ?Sized,
    {
        if !self.should_publish(block_height, best_header_height) {
            return Ok(None);
        }

        if manifest_store.get(&block_hash)?.is_some() {
            tracing::debug!("UTXO commitment #{block_height},{block_hash} already exists");
            return Ok(None);
        }

        let snapshot = working_set.snapshot()?;
        let commitment =
            builder.build_and_store(manifest_store, block_hash, block_height, &snapshot)?;

        let pruned = manifest_store.prune(self.options.commitments_to_keep, builder.output_dir())?;
        if !pruned.is_empty() {
            tracing::info!("Pruned {} outdated UTXO commitments", pruned.len());
        }

        Ok(Some(commitment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_publish() {
        let scheduler = CommitmentScheduler::new(SchedulerOptions::default());

        // Not on the interval.
        assert!(!scheduler.should_publish(10_001, 10_200));
        // Not buried enough.
        assert!(!scheduler.should_publish(10_000, 10_050));
        assert!(scheduler.should_publish(10_000, 10_100));
        // Too far behind the tip during initial sync.
        assert!(!scheduler.should_publish(10_000, 40_000));
        assert!(scheduler.should_publish(30_000, 40_000));
        assert!(scheduler.should_publish(20_000, 29_999));
        assert!(!scheduler.should_publish(20_000, 40_000));
    }

    #[test]
    fn test_min_block_height() {
        let scheduler = CommitmentScheduler::new(SchedulerOptions {
            min_block_height: 650_000,
            ..Default::default()
        });
        assert!(!scheduler.should_publish(640_000, 640_100));
        assert!(scheduler.should_publish(650_000, 650_100));

        assert_eq!(scheduler.next_publish_height(0), Some(650_000));
        assert_eq!(scheduler.next_publish_height(650_000), Some(660_000));
        assert_eq!(scheduler.next_publish_height(655_555), Some(660_000));
    }

    #[test]
    fn test_zero_interval_disables_publishing() {
        let scheduler = CommitmentScheduler::new(SchedulerOptions {
            publish_interval: 0,
            ..Default::default()
        });
        assert!(!scheduler.should_publish(0, 1_000));
        assert_eq!(scheduler.next_publish_height(5), None);
    }
}
