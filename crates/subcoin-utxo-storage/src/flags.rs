use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Per-entry bookkeeping of the working set.
    ///
    /// The flags are independent of each other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SpentState: u8 {
        /// The output has been consumed by a later input.
        const IS_SPENT = 1 << 0;
        /// The current value of the entry is present in the durable store.
        const IS_FLUSHED_TO_DISK = 1 << 1;
        /// The entry must be persisted by the next flush regardless of eviction selection.
        const FORCE_FLUSH = 1 << 2;
    }
}

impl SpentState {
    /// Flags of a freshly created output.
    pub const fn unspent() -> Self {
        Self::empty()
    }

    /// Flags of a spent entry whose durable copy still has to be removed.
    pub const fn spent_tombstone() -> Self {
        Self::IS_SPENT.union(Self::FORCE_FLUSH)
    }

    pub fn is_spent(&self) -> bool {
        self.contains(Self::IS_SPENT)
    }

    pub fn set_spent(&mut self, value: bool) {
        self.set(Self::IS_SPENT, value);
    }

    pub fn is_flushed_to_disk(&self) -> bool {
        self.contains(Self::IS_FLUSHED_TO_DISK)
    }

    pub fn set_flushed_to_disk(&mut self, value: bool) {
        self.set(Self::IS_FLUSHED_TO_DISK, value);
    }

    pub fn is_force_flush(&self) -> bool {
        self.contains(Self::FORCE_FLUSH)
    }

    pub fn set_force_flush(&mut self, value: bool) {
        self.set(Self::FORCE_FLUSH, value);
    }

    /// Returns `true` if the durable store may hold a copy of this entry.
    pub fn may_be_durable(&self) -> bool {
        self.intersects(Self::IS_FLUSHED_TO_DISK | Self::FORCE_FLUSH)
    }

    pub fn to_u8(self) -> u8 {
        self.bits()
    }

    /// Unknown bits are dropped.
    pub fn from_u8(bits: u8) -> Self {
        Self::from_bits_truncate(bits)
    }
}

impl Serialize for SpentState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_u8())
    }
}

impl<'de> Deserialize<'de> for SpentState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let mut state = SpentState::unspent();
        assert!(!state.is_spent());
        assert!(!state.is_flushed_to_disk());
        assert!(!state.is_force_flush());

        state.set_spent(true);
        state.set_force_flush(true);
        assert!(state.is_spent());
        assert!(!state.is_flushed_to_disk());
        assert!(state.is_force_flush());

        state.set_spent(false);
        assert!(!state.is_spent());
        assert!(state.is_force_flush());
        assert_eq!(state, SpentState::FORCE_FLUSH);
    }

    #[test]
    fn test_integer_roundtrip() {
        for bits in 0u8..8 {
            assert_eq!(SpentState::from_u8(bits).to_u8(), bits);
        }
        assert_eq!(SpentState::from_u8(0xff).to_u8(), 0b111);
        assert_eq!(SpentState::spent_tombstone().to_u8(), 0b101);
    }

    #[test]
    fn test_may_be_durable() {
        assert!(!SpentState::unspent().may_be_durable());
        assert!(SpentState::IS_FLUSHED_TO_DISK.may_be_durable());
        assert!(SpentState::spent_tombstone().may_be_durable());
        assert!(!SpentState::IS_SPENT.may_be_durable());
    }
}
