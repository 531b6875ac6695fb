//! Byte format of committed UTXOs.
//!
//! ```text
//! txid            32 bytes (internal byte order)
//! vout            u32 LE
//! block_height    u32 LE
//! is_coinbase     u8
//! amount          u64 LE
//! script_len      CompactSize
//! locking_script  script_len bytes
//! ```
//!
//! The same bytes are both the multiset item and the payload file record.

use crate::{Error, Result};
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use std::io::{self, ErrorKind, Read, Write};
use subcoin_utxo_storage::{UtxoEntry, UtxoKey, UtxoValue};

/// Upper bound on the locking script length accepted when decoding.
const MAX_SCRIPT_LEN: u64 = 4_000_000;

/// Length of the fixed-size prefix preceding the script length.
const FIXED_LEN: usize = 32 + 4 + 4 + 1 + 8;

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L305
/// Number of bytes [`write_compact_size`] emits for `size`.
pub fn compact_size_len(size: u64) -> usize {
    match size {
        0..=252 => 1,
        253..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

pub fn write_compact_size<W: Write>(writer: &mut W, size: u64) -> io::Result<()> {
    if size < 253 {
        writer.write_all(&[size as u8])?;
    } else if size <= 0xFFFF {
        writer.write_all(&[253])?;
        writer.write_all(&(size as u16).to_le_bytes())?;
    } else if size <= 0xFFFF_FFFF {
        writer.write_all(&[254])?;
        writer.write_all(&(size as u32).to_le_bytes())?;
    } else {
        writer.write_all(&[255])?;
        writer.write_all(&size.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a CompactSize, rejecting non-canonical encodings.
pub fn read_compact_size<R: Read>(reader: &mut R) -> Result<u64> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;

    let (size, min) = match tag[0] {
        253 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            (u16::from_le_bytes(buf) as u64, 253)
        }
        254 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            (u32::from_le_bytes(buf) as u64, 0x1_0000)
        }
        255 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            (u64::from_le_bytes(buf), 0x1_0000_0000)
        }
        size => return Ok(size as u64),
    };

    if size < min {
        return Err(Error::MalformedEntry(format!(
            "non-canonical compact size {size}"
        )));
    }

    Ok(size)
}

/// UTXO in the form it is committed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedUtxo {
    pub key: UtxoKey,
    pub block_height: u32,
    pub is_coinbase: bool,
    pub amount: u64,
    pub locking_script: Vec<u8>,
}

impl CommittedUtxo {
    /// Returns `None` for entries that must not be committed: spent values and non-positive
    /// amounts.
    pub fn from_entry(entry: UtxoEntry) -> Option<Self> {
        let UtxoEntry { key, value } = entry;
        if !value.is_unspent() || value.amount <= 0 {
            return None;
        }
        Some(Self {
            key,
            block_height: value.block_height,
            is_coinbase: value.is_coinbase,
            amount: value.amount as u64,
            locking_script: value.locking_script,
        })
    }

    /// Converts back into a ledger entry, as found in the durable store.
    pub fn into_entry(self) -> Result<UtxoEntry> {
        let amount = i64::try_from(self.amount)
            .map_err(|_| Error::MalformedEntry(format!("amount {} out of range", self.amount)))?;
        Ok(UtxoEntry::new(
            self.key,
            UtxoValue::unspent(
                self.block_height,
                self.is_coinbase,
                amount,
                self.locking_script,
            ),
        ))
    }

    /// Size of the serialized form.
    pub fn encoded_len(&self) -> usize {
        let script_len = self.locking_script.len();
        FIXED_LEN + compact_size_len(script_len as u64) + script_len
    }

    pub fn encode<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.key.txid.as_byte_array())?;
        writer.write_all(&self.key.vout.to_le_bytes())?;
        writer.write_all(&self.block_height.to_le_bytes())?;
        writer.write_all(&[self.is_coinbase as u8])?;
        writer.write_all(&self.amount.to_le_bytes())?;
        write_compact_size(writer, self.locking_script.len() as u64)?;
        writer.write_all(&self.locking_script)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        // Writing into a Vec cannot fail.
        let _ = self.encode(&mut bytes);
        bytes
    }

    /// Decodes the next entry, returning `None` at a clean end of stream.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut fixed = [0u8; FIXED_LEN];
        if !read_exact_or_eof(reader, &mut fixed)? {
            return Ok(None);
        }

        let mut txid = [0u8; 32];
        txid.copy_from_slice(&fixed[..32]);
        let le_u32 = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&fixed[offset..offset + 4]);
            u32::from_le_bytes(buf)
        };
        let vout = le_u32(32);
        let block_height = le_u32(36);
        let is_coinbase = match fixed[40] {
            0 => false,
            1 => true,
            flag => {
                return Err(Error::MalformedEntry(format!("invalid coinbase flag {flag}")));
            }
        };
        let mut amount = [0u8; 8];
        amount.copy_from_slice(&fixed[41..49]);

        let script_len = read_compact_size(reader).map_err(truncated)?;
        if script_len > MAX_SCRIPT_LEN {
            return Err(Error::MalformedEntry(format!(
                "locking script of {script_len} bytes exceeds {MAX_SCRIPT_LEN}"
            )));
        }
        let mut locking_script = vec![0u8; script_len as usize];
        reader.read_exact(&mut locking_script).map_err(Error::Io).map_err(truncated)?;

        Ok(Some(Self {
            key: UtxoKey::new(Txid::from_byte_array(txid), vout),
            block_height,
            is_coinbase,
            amount: u64::from_le_bytes(amount),
            locking_script,
        }))
    }
}

fn truncated(err: Error) -> Error {
    match err {
        Error::Io(err) if err.kind() == ErrorKind::UnexpectedEof => {
            Error::MalformedEntry("truncated entry".to_string())
        }
        err => err,
    }
}

/// Fills `buf` completely, or returns `false` if the stream ended before the first byte.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Error::MalformedEntry("truncated entry".to_string())),
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // Output 0 of the coinbase of block 1.
    const BLOCK_1_COINBASE: [u8; 117] = hex!(
        "982051FD1E4BA744BBBE680E1FEE14677BA1A3C3540BF7B1CDB606E857233E0E00000000010000000100F2052A0100000043410496B538E853519C726A2C91E61EC11600AE1390813A627C66FB8BE7947BE63C52DA7589379515D4E0A604F8141781E62294721166BF621E73A82CBF2342C858EEAC"
    );

    fn block_1_coinbase() -> CommittedUtxo {
        CommittedUtxo {
            key: UtxoKey::new(
                "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098"
                    .parse()
                    .unwrap(),
                0,
            ),
            block_height: 1,
            is_coinbase: true,
            amount: 5_000_000_000,
            locking_script: hex!(
                "410496B538E853519C726A2C91E61EC11600AE1390813A627C66FB8BE7947BE63C52DA7589379515D4E0A604F8141781E62294721166BF621E73A82CBF2342C858EEAC"
            )
            .to_vec(),
        }
    }

    #[test]
    fn test_block_1_coinbase_encoding() {
        let utxo = block_1_coinbase();
        assert_eq!(utxo.encoded_len(), BLOCK_1_COINBASE.len());
        assert_eq!(utxo.to_bytes(), BLOCK_1_COINBASE);

        let decoded = CommittedUtxo::decode(&mut &BLOCK_1_COINBASE[..])
            .unwrap()
            .unwrap();
        assert_eq!(decoded, utxo);
    }

    #[test]
    fn test_decode_stream() {
        let mut bytes = block_1_coinbase().to_bytes();
        let mut second = block_1_coinbase();
        second.key.vout = 1;
        second.locking_script = vec![0x51; 300];
        bytes.extend(second.to_bytes());

        let mut reader = &bytes[..];
        assert_eq!(
            CommittedUtxo::decode(&mut reader).unwrap().unwrap(),
            block_1_coinbase()
        );
        assert_eq!(CommittedUtxo::decode(&mut reader).unwrap().unwrap(), second);
        assert!(CommittedUtxo::decode(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = block_1_coinbase().to_bytes();
        for len in [1, 40, 49, 60, bytes.len() - 1] {
            let err = CommittedUtxo::decode(&mut &bytes[..len]).unwrap_err();
            assert!(matches!(err, Error::MalformedEntry(_)), "len {len}: {err}");
        }
    }

    #[test]
    fn test_compact_size() {
        for size in [0u64, 252, 253, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 0x1_0000_0000, u64::MAX] {
            let mut bytes = Vec::new();
            write_compact_size(&mut bytes, size).unwrap();
            assert_eq!(bytes.len(), compact_size_len(size), "size {size}");
            assert_eq!(read_compact_size(&mut &bytes[..]).unwrap(), size);
        }

        // 252 encoded with the 3-byte form.
        assert!(matches!(
            read_compact_size(&mut &[253u8, 252, 0][..]),
            Err(Error::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_encoded_len_of_large_script() {
        let mut utxo = block_1_coinbase();
        for script_len in [252, 253, 0xFFFF, 0x1_0000] {
            utxo.locking_script = vec![0x6a; script_len];
            assert_eq!(utxo.encoded_len(), utxo.to_bytes().len(), "script of {script_len} bytes");
        }
    }

    #[test]
    fn test_uncommittable_entries() {
        let key = UtxoKey::new(Txid::all_zeros(), 0);
        let zero = UtxoEntry::new(key, UtxoValue::unspent(1, false, 0, vec![]));
        assert!(CommittedUtxo::from_entry(zero).is_none());
        let spent = UtxoEntry::new(key, UtxoValue::tombstone(1));
        assert!(CommittedUtxo::from_entry(spent).is_none());
    }
}
