//! Keys and values of the UTXO ledger.

use crate::{Error, Result, SpentState};
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Block height of an entry whose creation height is no longer known.
pub const UNKNOWN_BLOCK_HEIGHT: u32 = u32::MAX;

/// Amount of an entry that has been spent and pruned.
pub const SPENT_AMOUNT: i64 = -1;

/// Unique identifier of an output.
///
/// Ordered by the txid in display (big-endian hex) byte order, then by the output index. This
/// order is used everywhere: eviction tie-breaks, durable store iteration and commitment
/// payloads, which are therefore sorted the same way as by `ORDER BY txid, vout` over hex txids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoKey {
    pub txid: Txid,
    pub vout: u32,
}

impl UtxoKey {
    /// Size of the storage encoding.
    pub const ENCODED_LEN: usize = 36;

    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Storage key.
    ///
    /// Format: txid (32 bytes, display order) || vout (4 bytes, big-endian), so that the byte
    /// order of encoded keys matches the order of [`UtxoKey`].
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut key = [0u8; Self::ENCODED_LEN];
        key[..32].copy_from_slice(self.txid.as_byte_array());
        key[..32].reverse();
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }

    /// Parses a storage key produced by [`UtxoKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: &[u8; Self::ENCODED_LEN] = bytes
            .try_into()
            .map_err(|_| Error::CorruptEntry(format!("invalid key length {}", bytes.len())))?;

        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        txid.reverse();
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&key[32..]);

        Ok(Self {
            txid: Txid::from_byte_array(txid),
            vout: u32::from_be_bytes(vout),
        })
    }
}

impl Ord for UtxoKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.txid
            .as_byte_array()
            .iter()
            .rev()
            .cmp(other.txid.as_byte_array().iter().rev())
            .then(self.vout.cmp(&other.vout))
    }
}

impl PartialOrd for UtxoKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for UtxoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl From<OutPoint> for UtxoKey {
    fn from(outpoint: OutPoint) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

impl From<UtxoKey> for OutPoint {
    fn from(key: UtxoKey) -> Self {
        OutPoint {
            txid: key.txid,
            vout: key.vout,
        }
    }
}

/// State of an output as tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoValue {
    pub spent_state: SpentState,
    /// Creation height, [`UNKNOWN_BLOCK_HEIGHT`] for pruned tombstones.
    pub block_height: u32,
    pub is_coinbase: bool,
    /// Amount in satoshis, [`SPENT_AMOUNT`] once pruned.
    pub amount: i64,
    /// Empty once pruned.
    pub locking_script: Vec<u8>,
}

impl UtxoValue {
    /// Creates the value of a freshly connected output.
    pub fn unspent(
        block_height: u32,
        is_coinbase: bool,
        amount: i64,
        locking_script: Vec<u8>,
    ) -> Self {
        Self {
            spent_state: SpentState::unspent(),
            block_height,
            is_coinbase,
            amount,
            locking_script,
        }
    }

    /// Creates a spent marker which deletes the durable copy on the next flush.
    pub fn tombstone(block_height: u32) -> Self {
        Self {
            spent_state: SpentState::spent_tombstone(),
            block_height,
            is_coinbase: false,
            amount: SPENT_AMOUNT,
            locking_script: Vec::new(),
        }
    }

    pub fn is_spent(&self) -> bool {
        self.spent_state.is_spent()
    }

    /// Returns `true` if the value describes a spendable output.
    pub fn is_unspent(&self) -> bool {
        !self.spent_state.is_spent() && self.amount >= 0
    }

    pub(crate) fn encode_for_storage(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    pub(crate) fn decode_from_storage(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}

/// A `(UtxoKey, UtxoValue)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub key: UtxoKey,
    pub value: UtxoValue,
}

impl UtxoEntry {
    pub fn new(key: UtxoKey, value: UtxoValue) -> Self {
        Self { key, value }
    }
}

/// An output created by a connected block, input of
/// [`UtxoWorkingSet::insert_unspent_outputs`](crate::UtxoWorkingSet::insert_unspent_outputs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOutput {
    pub key: UtxoKey,
    pub is_coinbase: bool,
    pub amount: u64,
    pub locking_script: Vec<u8>,
}

impl CreatedOutput {
    /// Collects the spendable outputs of `tx`.
    ///
    /// OP_RETURN outputs are provably unspendable and never enter the ledger.
    pub fn from_transaction(tx: &Transaction) -> Vec<Self> {
        let txid = tx.compute_txid();
        let is_coinbase = tx.is_coinbase();

        tx.output
            .iter()
            .enumerate()
            .filter(|(_, output)| !output.script_pubkey.is_op_return())
            .map(|(vout, output)| Self {
                key: UtxoKey::new(txid, vout as u32),
                is_coinbase,
                amount: output.value.to_sat(),
                locking_script: output.script_pubkey.to_bytes(),
            })
            .collect()
    }

    pub(crate) fn into_value(self, block_height: u32) -> (UtxoKey, UtxoValue) {
        let amount = i64::try_from(self.amount).unwrap_or(i64::MAX);
        (
            self.key,
            UtxoValue::unspent(block_height, self.is_coinbase, amount, self.locking_script),
        )
    }
}
