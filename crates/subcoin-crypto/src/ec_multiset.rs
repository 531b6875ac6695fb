//! Elliptic curve multiset hash over secp256k1.
//!
//! Every item is mapped onto a curve point and the multiset is represented by the sum of the
//! points of its members, which makes the digest independent of insertion order and lets two
//! multisets be combined without touching their members again.
//!
//! The mapping follows the ECMH construction used by the Bitcoin Cash UTXO commitment proposal:
//!
//! ```text
//! h = SHA256(item)
//! for n in 0.. {
//!     x = SHA256(n as u64 little endian || h)
//!     if x is a valid x coordinate, return the point (x, y) with even y
//! }
//! ```

use crate::Error;
use bitcoin::secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;

/// Digest of the empty multiset.
pub const EMPTY_HASH: [u8; 32] = [0u8; 32];

/// Encoding of the empty multiset (the point at infinity).
pub const EMPTY_PUBLIC_KEY: [u8; 33] = [0u8; 33];

const COMPRESSED_EVEN_Y: u8 = 0x02;

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Maps `item` deterministically onto a secp256k1 point.
fn hash_to_point(item: &[u8]) -> PublicKey {
    let item_hash: [u8; 32] = Sha256::digest(item).into();

    let mut encoded = [0u8; 33];
    encoded[0] = COMPRESSED_EVEN_Y;

    let mut n: u64 = 0;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(n.to_le_bytes());
        hasher.update(item_hash);
        encoded[1..].copy_from_slice(&hasher.finalize());

        // Parsing fails when x >= p or x^3 + 7 has no square root.
        if let Ok(point) = PublicKey::from_slice(&encoded) {
            return point;
        }

        n = n.wrapping_add(1);
    }
}

/// Multiset of byte items accumulated as a single curve point.
///
/// `None` is the point at infinity, i.e. the empty multiset, which secp256k1 cannot represent
/// as a [`PublicKey`].
#[derive(Clone, Copy, Default)]
pub struct EcMultiset {
    point: Option<PublicKey>,
}

impl EcMultiset {
    /// Creates an empty multiset.
    pub fn new() -> Self {
        Self { point: None }
    }

    /// Restores a multiset from its compressed public key.
    ///
    /// [`EMPTY_PUBLIC_KEY`] restores the empty multiset.
    pub fn from_public_key(public_key: &[u8]) -> Result<Self, Error> {
        if public_key == EMPTY_PUBLIC_KEY {
            return Ok(Self::new());
        }

        PublicKey::from_slice(public_key)
            .map(|point| Self { point: Some(point) })
            .map_err(|err| Error::InvalidPublicKey(err.to_string()))
    }

    /// Returns `true` if the multiset sums to the point at infinity.
    pub fn is_empty(&self) -> bool {
        self.point.is_none()
    }

    /// Adds one copy of `item`.
    pub fn add_item(&mut self, item: &[u8]) {
        self.add_point(hash_to_point(item));
    }

    /// Removes one copy of `item`.
    ///
    /// Removing an item that was never added is allowed, the multiset then carries a
    /// "negative" copy which a later addition cancels.
    pub fn remove_item(&mut self, item: &[u8]) {
        self.add_point(hash_to_point(item).negate(&SECP));
    }

    /// Merges `other` into this multiset.
    pub fn merge(&mut self, other: &EcMultiset) {
        if let Some(point) = other.point {
            self.add_point(point);
        }
    }

    /// Merges the multiset encoded by `public_key` into this one.
    pub fn add_public_key(&mut self, public_key: &[u8]) -> Result<(), Error> {
        let other = Self::from_public_key(public_key)?;
        self.merge(&other);
        Ok(())
    }

    /// Returns the 32-byte digest of the multiset.
    ///
    /// The digest is `SHA256(x || y)` over the big endian affine coordinates, or
    /// [`EMPTY_HASH`] for the empty multiset.
    pub fn hash(&self) -> [u8; 32] {
        match self.point {
            Some(point) => {
                let uncompressed = point.serialize_uncompressed();
                Sha256::digest(&uncompressed[1..]).into()
            }
            None => EMPTY_HASH,
        }
    }

    /// Returns the 33-byte compressed encoding of the multiset.
    pub fn public_key(&self) -> [u8; 33] {
        match self.point {
            Some(point) => point.serialize(),
            None => EMPTY_PUBLIC_KEY,
        }
    }

    fn add_point(&mut self, point: PublicKey) {
        self.point = match self.point {
            // `combine` only fails when the sum is the point at infinity.
            Some(current) => current.combine(&point).ok(),
            None => Some(point),
        };
    }
}

impl PartialEq for EcMultiset {
    fn eq(&self, other: &Self) -> bool {
        self.public_key() == other.public_key()
    }
}

impl Eq for EcMultiset {}

impl fmt::Debug for EcMultiset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let public_key = self.public_key();
        f.debug_struct("EcMultiset")
            .field("public_key", &HexBytes(&public_key))
            .finish()
    }
}

struct HexBytes<'a>(&'a [u8]);

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
