//! UTXO dumps in the `dumptxoutset --csv` format.
//!
//! One UTXO per line, no header: `txid:vout,is_coinbase,height,amount,script_pubkey_hex`.

use crate::{Error, Result};
use bitcoin::OutPoint;
use serde::Deserialize;
use std::io::Read;
use std::str::FromStr;
use subcoin_utxo_storage::{UtxoEntry, UtxoKey, UtxoValue};

#[derive(Debug, Deserialize)]
struct UtxoCsvEntry {
    outpoint: String,
    is_coinbase: bool,
    height: u32,
    amount: u64,
    script_pubkey: String,
}

impl TryFrom<UtxoCsvEntry> for UtxoEntry {
    type Error = Error;

    fn try_from(csv_entry: UtxoCsvEntry) -> Result<Self> {
        let UtxoCsvEntry {
            outpoint,
            is_coinbase,
            height,
            amount,
            script_pubkey,
        } = csv_entry;

        let outpoint = OutPoint::from_str(&outpoint)
            .map_err(|err| Error::Input(format!("Invalid outpoint {outpoint}: {err}")))?;
        let amount = i64::try_from(amount)
            .map_err(|_| Error::Input(format!("Amount of {outpoint} out of range: {amount}")))?;
        let script_pubkey = hex::decode(&script_pubkey)
            .map_err(|err| Error::Input(format!("Invalid script_pubkey of {outpoint}: {err}")))?;

        Ok(UtxoEntry::new(
            UtxoKey::from(outpoint),
            UtxoValue::unspent(height, is_coinbase, amount, script_pubkey),
        ))
    }
}

/// Reads all UTXOs of a dump, sorted by key.
///
/// Fails on duplicate outpoints.
pub(crate) fn read_utxos<R: Read>(reader: R) -> Result<Vec<UtxoEntry>> {
    let csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(reader);

    let mut entries = csv_reader
        .into_deserialize::<UtxoCsvEntry>()
        .map(|record| UtxoEntry::try_from(record?))
        .collect::<Result<Vec<_>>>()?;

    entries.sort_unstable_by_key(|entry| entry.key);
    if let Some(pair) = entries.windows(2).find(|pair| pair[0].key == pair[1].key) {
        return Err(Error::Input(format!("Duplicate UTXO {}", pair[0].key)));
    }

    Ok(entries)
}
