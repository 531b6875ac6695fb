use bitcoin::Txid;
use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};

/// Default capacity of the working set.
pub const DEFAULT_MAX_UTXO_COUNT: usize = 1 << 22;

/// Coinbase txids that were created twice before BIP30 was enforced (blocks 91722/91880 and
/// 91812/91842), in internal byte order.
const BIP30_DUPLICATE_TXIDS: [[u8; 32]; 2] = [
    // d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599
    [
        0x99, 0x85, 0xd8, 0x29, 0x54, 0xe1, 0x0f, 0x22, 0x33, 0xa0, 0x89, 0x05, 0xdc, 0x7b, 0x49,
        0x0e, 0xb4, 0x44, 0x66, 0x0c, 0x87, 0x59, 0xe3, 0x24, 0xc7, 0xdf, 0xa3, 0xd2, 0x87, 0x79,
        0xd2, 0xd5,
    ],
    // e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468
    [
        0x68, 0xb4, 0x5f, 0x58, 0xb6, 0x74, 0xe9, 0x4e, 0xb8, 0x81, 0xcd, 0x67, 0xb0, 0x4c, 0x2c,
        0xba, 0x07, 0xfe, 0x55, 0x52, 0xdb, 0xf1, 0xd5, 0x38, 0x56, 0x37, 0xb0, 0xd4, 0x07, 0x3d,
        0xbf, 0xe3,
    ],
];

/// Returns the txids allowed to overwrite an existing unspent output.
pub fn bip30_duplicate_txids() -> Vec<Txid> {
    BIP30_DUPLICATE_TXIDS
        .iter()
        .map(|bytes| Txid::from_byte_array(*bytes))
        .collect()
}

/// Configuration options for the UTXO working set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkingSetOptions {
    /// Number of resident entries that triggers an eviction; half of it stays resident.
    pub max_utxo_count: usize,

    /// Txids whose outputs may be created again while still unspent.
    pub duplicate_txids: Vec<Txid>,
}

impl Default for WorkingSetOptions {
    fn default() -> Self {
        Self {
            max_utxo_count: DEFAULT_MAX_UTXO_COUNT,
            duplicate_txids: bip30_duplicate_txids(),
        }
    }
}

impl WorkingSetOptions {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_utxo_count(mut self, max_utxo_count: usize) -> Self {
        self.max_utxo_count = max_utxo_count;
        self
    }

    /// Number of entries left resident after an eviction.
    pub fn resident_target(&self) -> usize {
        self.max_utxo_count / 2
    }
}
