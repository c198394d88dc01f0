//! Capability sets exchanged in `hello` packets.
//!
//! A set is a fixed-width bitmask sized in 32-bit words; the wire carries the
//! word array verbatim. Two sets are tracked per connection (ours and the
//! peer's) and an extension is only in effect when both sides announce it.

use log::warn;

use crate::proto::{CAP_BULK_STREAMS, CAP_EP_INFO_MAX_PACKET_SIZE, CAPS_WORDS};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapSet {
    words: [u32; CAPS_WORDS],
}

impl CapSet {
    pub const fn empty() -> Self {
        CapSet {
            words: [0; CAPS_WORDS],
        }
    }

    /// Build a set from a list of capability bit numbers.
    pub fn from_bits(bits: &[u32]) -> Self {
        let mut set = CapSet::empty();
        for &bit in bits {
            set.set(bit);
        }
        set
    }

    /// Build a set from wire words. Extra words beyond what we understand are
    /// dropped; missing words read as zero.
    pub fn from_words(words: &[u32]) -> Self {
        let mut set = CapSet::empty();
        for (dst, src) in set.words.iter_mut().zip(words.iter()) {
            *dst = *src;
        }
        set
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn has(&self, bit: u32) -> bool {
        let word = (bit / 32) as usize;
        word < CAPS_WORDS && self.words[word] & (1 << (bit % 32)) != 0
    }

    pub fn set(&mut self, bit: u32) {
        let word = (bit / 32) as usize;
        if word < CAPS_WORDS {
            self.words[word] |= 1 << (bit % 32);
        } else {
            warn!("capability bit {} out of range, ignoring", bit);
        }
    }

    pub fn clear(&mut self, bit: u32) {
        let word = (bit / 32) as usize;
        if word < CAPS_WORDS {
            self.words[word] &= !(1 << (bit % 32));
        }
    }

    /// The capabilities in effect: announced by both sides.
    pub fn intersect(&self, other: &CapSet) -> CapSet {
        let mut out = CapSet::empty();
        for i in 0..CAPS_WORDS {
            out.words[i] = self.words[i] & other.words[i];
        }
        out
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &CapSet) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Enforce inter-capability rules: `bulk_streams` is meaningless without
    /// `ep_info_max_packet_size`, so violating sets get it masked off.
    pub fn sanitize(&mut self, whose: &str) {
        if self.has(CAP_BULK_STREAMS) && !self.has(CAP_EP_INFO_MAX_PACKET_SIZE) {
            warn!(
                "{} caps have bulk_streams without ep_info_max_packet_size, dropping bulk_streams",
                whose
            );
            self.clear(CAP_BULK_STREAMS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::*;

    #[test]
    fn set_and_query_bits() {
        let caps = CapSet::from_bits(&[CAP_FILTER, CAP_64BITS_IDS]);
        assert!(caps.has(CAP_FILTER));
        assert!(caps.has(CAP_64BITS_IDS));
        assert!(!caps.has(CAP_BULK_STREAMS));
        assert_eq!(caps.words()[0], (1 << CAP_FILTER) | (1 << CAP_64BITS_IDS));
    }

    #[test]
    fn intersect_is_mutual() {
        let ours = CapSet::from_bits(&[CAP_FILTER, CAP_64BITS_IDS, CAP_BULK_RECEIVING]);
        let theirs = CapSet::from_bits(&[CAP_64BITS_IDS, CAP_32BITS_BULK_LENGTH]);
        let eff = ours.intersect(&theirs);
        assert!(eff.has(CAP_64BITS_IDS));
        assert!(!eff.has(CAP_FILTER));
        assert!(!eff.has(CAP_32BITS_BULK_LENGTH));
    }

    #[test]
    fn sanitize_drops_orphan_bulk_streams() {
        let mut caps = CapSet::from_bits(&[CAP_BULK_STREAMS]);
        caps.sanitize("test");
        assert!(!caps.has(CAP_BULK_STREAMS));

        let mut caps = CapSet::from_bits(&[CAP_BULK_STREAMS, CAP_EP_INFO_MAX_PACKET_SIZE]);
        caps.sanitize("test");
        assert!(caps.has(CAP_BULK_STREAMS));
    }

    #[test]
    fn from_words_ignores_extra_words() {
        let caps = CapSet::from_words(&[0x3f, 0xdead_beef]);
        assert_eq!(caps.words(), &[0x3f]);
    }

    #[test]
    fn subset() {
        let small = CapSet::from_bits(&[CAP_FILTER]);
        let big = CapSet::from_bits(&[CAP_FILTER, CAP_64BITS_IDS]);
        assert!(small.is_subset_of(&big));
        assert!(!big.is_subset_of(&small));
    }
}
