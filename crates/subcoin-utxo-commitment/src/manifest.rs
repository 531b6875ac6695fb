//! Commitment manifest types.
//!
//! A manifest describes a commitment down to its payload files and is what peers exchange
//! before downloading the files. The JSON form uses camelCase keys and lowercase hex for keys
//! and hashes; `blockHash` uses the usual reversed display hex.

use crate::{Error, Result};
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use subcoin_crypto::{EMPTY_PUBLIC_KEY, EcMultiset};

/// Number of buckets of a commitment.
pub const BUCKET_COUNT: usize = 128;

/// File name recorded for the placeholder sub-bucket of an empty bucket. No such file is ever
/// written.
pub const EMPTY_BUCKET_NAME: &str = "EMPTY";

mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let hex_str = String::deserialize(deserializer)?;
        let mut bytes = [0u8; N];
        hex::decode_to_slice(&hex_str, &mut bytes).map_err(D::Error::custom)?;
        Ok(bytes)
    }
}

/// A payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubBucket {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub public_key: [u8; 33],
    pub utxo_count: u64,
    pub byte_count: u64,
}

impl SubBucket {
    /// Placeholder recorded for a bucket without any UTXO.
    pub fn empty() -> Self {
        Self {
            index: 0,
            public_key: EMPTY_PUBLIC_KEY,
            utxo_count: 0,
            byte_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.utxo_count == 0 && self.public_key == EMPTY_PUBLIC_KEY
    }

    /// Name of the payload file: the hex of its public key.
    pub fn file_name(&self) -> String {
        if self.is_empty() {
            EMPTY_BUCKET_NAME.to_string()
        } else {
            hex::encode(self.public_key)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub public_key: [u8; 33],
    pub sub_buckets: Vec<SubBucket>,
}

impl Bucket {
    pub fn utxo_count(&self) -> u64 {
        self.sub_buckets.iter().map(|sub| sub.utxo_count).sum()
    }

    pub fn byte_count(&self) -> u64 {
        self.sub_buckets.iter().map(|sub| sub.byte_count).sum()
    }

    /// Merges the sub-bucket public keys.
    pub fn compute_multiset(&self) -> Result<EcMultiset> {
        let mut multiset = EcMultiset::new();
        for sub_bucket in &self.sub_buckets {
            multiset.add_public_key(&sub_bucket.public_key)?;
        }
        Ok(multiset)
    }
}

/// Manifest of a UTXO commitment at a given block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoCommitment {
    pub block_hash: BlockHash,
    pub block_height: u32,
    /// Digest of the top-level multiset.
    #[serde(rename = "multisetHash", with = "hex_bytes")]
    pub hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub public_key: [u8; 33],
    pub byte_count: u64,
    pub buckets: Vec<Bucket>,
}

impl UtxoCommitment {
    pub fn utxo_count(&self) -> u64 {
        self.buckets.iter().map(Bucket::utxo_count).sum()
    }

    /// Iterates over all sub-buckets in bucket order.
    pub fn sub_buckets(&self) -> impl Iterator<Item = &SubBucket> {
        self.buckets.iter().flat_map(|bucket| bucket.sub_buckets.iter())
    }

    /// Names of the payload files that actually exist on disk.
    pub fn file_names(&self) -> impl Iterator<Item = String> + '_ {
        self.sub_buckets()
            .filter(|sub_bucket| !sub_bucket.is_empty())
            .map(SubBucket::file_name)
    }

    /// Replaces every bucket public key with the merge of its sub-buckets and checks the
    /// result against the declared top-level accumulator.
    pub fn rebuild_accumulators(&mut self) -> Result<()> {
        if self.buckets.len() != BUCKET_COUNT {
            return Err(Error::InvalidManifest(format!(
                "expected {BUCKET_COUNT} buckets, got {}",
                self.buckets.len()
            )));
        }

        let mut multiset = EcMultiset::new();
        for (index, bucket) in self.buckets.iter_mut().enumerate() {
            if bucket.index as usize != index {
                return Err(Error::InvalidManifest(format!(
                    "bucket {} found at position {index}",
                    bucket.index
                )));
            }
            let bucket_multiset = bucket.compute_multiset()?;
            bucket.public_key = bucket_multiset.public_key();
            multiset.merge(&bucket_multiset);
        }

        self.check_top_level(&multiset)
    }

    /// Checks bucket and top-level accumulators without modifying the manifest.
    pub fn verify_accumulators(&self) -> Result<()> {
        let mut rebuilt = self.clone();
        rebuilt.rebuild_accumulators()?;

        for (declared, rebuilt) in self.buckets.iter().zip(&rebuilt.buckets) {
            if declared.public_key != rebuilt.public_key {
                return Err(Error::AccumulatorMismatch {
                    context: format!("bucket {}", declared.index),
                    expected: hex::encode(declared.public_key),
                    actual: hex::encode(rebuilt.public_key),
                });
            }
        }

        Ok(())
    }

    fn check_top_level(&self, multiset: &EcMultiset) -> Result<()> {
        if multiset.public_key() != self.public_key {
            return Err(Error::AccumulatorMismatch {
                context: format!("commitment public key at #{}", self.block_height),
                expected: hex::encode(self.public_key),
                actual: hex::encode(multiset.public_key()),
            });
        }
        if multiset.hash() != self.hash {
            return Err(Error::AccumulatorMismatch {
                context: format!("commitment hash at #{}", self.block_height),
                expected: hex::encode(self.hash),
                actual: hex::encode(multiset.hash()),
            });
        }

        let byte_count = self.buckets.iter().map(Bucket::byte_count).sum::<u64>();
        if byte_count != self.byte_count {
            return Err(Error::CountMismatch {
                context: format!("commitment byte count at #{}", self.block_height),
                expected: self.byte_count,
                actual: byte_count,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn empty_commitment() -> UtxoCommitment {
        let buckets = (0..BUCKET_COUNT as u32)
            .map(|index| Bucket {
                index,
                public_key: EMPTY_PUBLIC_KEY,
                sub_buckets: vec![SubBucket::empty()],
            })
            .collect();
        UtxoCommitment {
            block_hash: BlockHash::all_zeros(),
            block_height: 0,
            hash: subcoin_crypto::EMPTY_HASH,
            public_key: EMPTY_PUBLIC_KEY,
            byte_count: 0,
            buckets,
        }
    }

    #[test]
    fn test_json_shape() {
        let block_hash: BlockHash =
            "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048"
                .parse()
                .unwrap();
        let commitment = UtxoCommitment {
            block_hash,
            block_height: 1,
            ..empty_commitment()
        };

        let json = serde_json::to_value(&commitment).unwrap();
        assert_eq!(
            json["blockHash"],
            "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048"
        );
        assert_eq!(json["blockHeight"], 1);
        assert_eq!(json["multisetHash"], "00".repeat(32));
        assert_eq!(json["publicKey"], "00".repeat(33));
        assert_eq!(json["byteCount"], 0);
        assert_eq!(json["buckets"].as_array().unwrap().len(), BUCKET_COUNT);
        assert_eq!(json["buckets"][5]["index"], 5);
        assert_eq!(json["buckets"][5]["subBuckets"][0]["utxoCount"], 0);

        let decoded: UtxoCommitment = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, commitment);
    }

    #[test]
    fn test_empty_commitment_is_consistent() {
        let commitment = empty_commitment();
        commitment.verify_accumulators().unwrap();
        assert_eq!(commitment.utxo_count(), 0);
        assert_eq!(commitment.file_names().count(), 0);
        assert_eq!(SubBucket::empty().file_name(), EMPTY_BUCKET_NAME);
    }

    #[test]
    fn test_wrong_bucket_count_rejected() {
        let mut commitment = empty_commitment();
        commitment.buckets.pop();
        assert!(matches!(
            commitment.rebuild_accumulators(),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_invalid_hex_rejected() {
        let mut json = serde_json::to_value(empty_commitment()).unwrap();
        json["publicKey"] = "zz".into();
        assert!(serde_json::from_value::<UtxoCommitment>(json).is_err());
    }
}
