use crate::store::StoreSnapshot;
use crate::{Result, UtxoEntry, UtxoKey, UtxoValue};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::iter::Peekable;

/// Point-in-time view of the whole ledger: the durable baseline overlaid with the resident
/// working set.
///
/// Later mutations of the working set or the durable store are not visible through it.
pub struct LedgerSnapshot<'a> {
    durable: Box<dyn StoreSnapshot + 'a>,
    resident: BTreeMap<UtxoKey, UtxoValue>,
}

impl<'a> LedgerSnapshot<'a> {
    pub(crate) fn new(
        durable: Box<dyn StoreSnapshot + 'a>,
        resident: BTreeMap<UtxoKey, UtxoValue>,
    ) -> Self {
        Self { durable, resident }
    }

    /// Number of resident entries captured, spent markers included.
    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    /// Iterates over the unspent entries in ascending [`UtxoKey`] order.
    ///
    /// Resident values take precedence over durable ones and spent values are skipped.
    pub fn entries(&self) -> UnspentEntries<'_> {
        UnspentEntries {
            durable: self.durable.entries().peekable(),
            resident: self.resident.iter().peekable(),
        }
    }
}

/// Iterator returned by [`LedgerSnapshot::entries`].
pub struct UnspentEntries<'s> {
    durable: Peekable<Box<dyn Iterator<Item = Result<UtxoEntry>> + 's>>,
    resident: Peekable<btree_map::Iter<'s, UtxoKey, UtxoValue>>,
}

impl Iterator for UnspentEntries<'_> {
    type Item = Result<UtxoEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let durable_key = match self.durable.peek() {
                Some(Ok(entry)) => Some(entry.key),
                Some(Err(_)) => return self.durable.next(),
                None => None,
            };
            let resident_key = self.resident.peek().map(|(key, _)| **key);

            let (key, value) = match (durable_key, resident_key) {
                (None, None) => return None,
                (durable_key, Some(resident_key))
                    if durable_key.is_none_or(|durable_key| resident_key <= durable_key) =>
                {
                    if durable_key == Some(resident_key) {
                        // Shadowed by the resident value.
                        self.durable.next();
                    }
                    let (key, value) = self.resident.next()?;
                    (*key, value.clone())
                }
                _ => match self.durable.next()? {
                    Ok(UtxoEntry { key, value }) => (key, value),
                    Err(err) => return Some(Err(err)),
                },
            };

            if value.is_unspent() {
                return Some(Ok(UtxoEntry::new(key, value)));
            }
        }
    }
}
