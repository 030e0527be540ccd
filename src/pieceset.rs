use crate::Bitfield;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PieceSetError {

    #[error("bitfield is {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },

    #[error("bitfield has non-zero trailing pad bits")]
    MalformedPadding,

}

/// Set of piece indices in `[0, capacity)`.
///
/// The wire representation is `ceil(capacity / 8)` bytes, most significant
/// bit first within each byte; pad bits past the last index are zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceSet {
    bits: Bitfield,
}

impl PieceSet {

    pub fn empty(capacity: usize) -> Self {
        Self { bits: Bitfield::repeat(false, capacity) }
    }

    pub fn full(capacity: usize) -> Self {
        Self { bits: Bitfield::repeat(true, capacity) }
    }

    // Number of indices the set ranges over, not the number of members.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        idx < self.bits.len() && self.bits[idx]
    }

    // Returns whether the index was newly inserted.
    pub fn insert(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.bits.len());
        let prev = self.bits[idx];
        self.bits.set(idx, true);
        !prev
    }

    pub fn remove(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.bits.len());
        let prev = self.bits[idx];
        self.bits.set(idx, false);
        prev
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bits.all()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    // Members of `self` that are not members of `other`.
    pub fn difference(&self, other: &PieceSet) -> PieceSet {
        debug_assert_eq!(self.capacity(), other.capacity());
        let mut out = self.clone();
        for idx in other.bits.iter_ones() {
            out.bits.set(idx, false);
        }
        out
    }

    pub fn union(&self, other: &PieceSet) -> PieceSet {
        debug_assert_eq!(self.capacity(), other.capacity());
        let mut out = self.clone();
        for idx in other.bits.iter_ones() {
            out.bits.set(idx, true);
        }
        out
    }

    pub fn intersection(&self, other: &PieceSet) -> PieceSet {
        debug_assert_eq!(self.capacity(), other.capacity());
        let mut out = PieceSet::empty(self.capacity());
        for idx in self.bits.iter_ones() {
            if other.bits[idx] {
                out.bits.set(idx, true);
            }
        }
        out
    }

    /// Parses a wire bitfield. The byte length must be exactly
    /// `ceil(capacity / 8)` and all pad bits must be zero.
    pub fn parse(bytes: &[u8], capacity: usize) -> Result<Self, PieceSetError> {
        let expected = (capacity + 7) / 8;
        if bytes.len() != expected {
            return Err(PieceSetError::BadLength { expected, actual: bytes.len() });
        }
        let mut bits = Bitfield::from_vec(bytes.to_vec());
        if bits[capacity..].any() {
            return Err(PieceSetError::MalformedPadding);
        }
        bits.truncate(capacity);
        Ok(Self { bits })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; (self.bits.len() + 7) / 8];
        for idx in self.bits.iter_ones() {
            out[idx / 8] |= 0x80 >> (idx % 8);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algebra() {
        let mut ours = PieceSet::empty(10);
        let mut theirs = PieceSet::empty(10);
        assert!(ours.insert(1));
        assert!(!ours.insert(1));
        ours.insert(4);
        theirs.insert(4);
        theirs.insert(7);

        // They have 7, we don't.
        let missing = theirs.difference(&ours);
        assert_eq!(missing.iter().collect::<Vec<_>>(), vec![7]);
        assert!(!missing.is_empty());

        assert_eq!(ours.union(&theirs).count(), 3);
        assert_eq!(ours.intersection(&theirs).iter().collect::<Vec<_>>(), vec![4]);

        assert!(ours.remove(4));
        assert!(!ours.contains(4));
    }

    #[test]
    fn test_full_and_empty() {
        assert!(PieceSet::full(33).is_full());
        assert!(PieceSet::empty(33).is_empty());
        assert_eq!(PieceSet::full(33).count(), 33);
    }

    #[test]
    fn test_wire_round_trip() {
        for capacity in [1, 7, 8, 9, 16, 31, 100] {
            let mut set = PieceSet::empty(capacity);
            for idx in (0..capacity).step_by(3) {
                set.insert(idx);
            }
            let bytes = set.serialize();
            assert_eq!(bytes.len(), (capacity + 7) / 8);
            let parsed = PieceSet::parse(&bytes, capacity).unwrap();
            assert_eq!(parsed, set);
        }
    }

    #[test]
    fn test_serialize_pads_zero() {
        let set = PieceSet::full(9);
        assert_eq!(set.serialize(), vec![0xff, 0x80]);
    }

    #[test]
    fn test_parse_rejects_padding() {
        // 9 pieces over 2 bytes, bit 10 set.
        let err = PieceSet::parse(&[0x00, 0x20], 9).unwrap_err();
        assert_eq!(err, PieceSetError::MalformedPadding);
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let err = PieceSet::parse(&[0x00], 9).unwrap_err();
        assert_eq!(err, PieceSetError::BadLength { expected: 2, actual: 1 });
    }

    #[test]
    fn test_two_piece_complete_bitfield() {
        // A completed 2-piece torrent serializes as 0b1100_0000.
        let set = PieceSet::full(2);
        assert_eq!(set.serialize(), vec![0xc0]);
    }
}
