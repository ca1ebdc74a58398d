//! Content fingerprints and zone routing.
//!
//! Deduplication is content-addressed: two blocks are candidates for sharing storage iff their
//! fingerprints match. The fingerprint is the first 128 bits of a SHA-256 digest. No
//! fingerprint function mapping a domain to a smaller codomain is injective, but at 128
//! cryptographic bits, finding a collision is practically impossible even for a malicious
//! host, which is what lets hash-lock members share an agent's block without re-reading it.
//!
//! Routing hashes are a separate concern with opposite requirements: they only spread load
//! across zones, so they use seahash, which is much cheaper than a cryptographic digest.

use ring::digest;

use crate::block::Lbn;

/// A 128-bit content fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    /// Fingerprint a block.
    pub fn new(block: &[u8]) -> Fingerprint {
        // Hash into a 256-bit digest and keep the first half.
        let digest = digest::digest(&digest::SHA256, block);
        let mut raw = [0; 16];
        raw.copy_from_slice(&digest.as_ref()[..16]);
        Fingerprint(u128::from_le_bytes(raw))
    }

    /// The hash zone owning this fingerprint.
    pub fn zone(&self, hash_zones: usize) -> usize {
        // The fingerprint is already uniformly distributed; fold it onto the zone count.
        (self.0 % hash_zones as u128) as usize
    }

    /// The advice-table bucket of this fingerprint within its zone.
    pub fn bucket(&self, buckets: usize) -> usize {
        ((self.0 >> 64) % buckets as u128) as usize
    }
}

/// The logical zone owning an LBN.
///
/// LBNs are assigned by hash rather than by range, so sequential host writes spread across the
/// logical zones instead of serializing on one of them.
pub fn logical_zone(lbn: Lbn, logical_zones: usize) -> usize {
    seahash::hash(&lbn.to_le_bytes()) as usize % logical_zones
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;

    #[test]
    fn equal_content_equal_fingerprint() {
        let a = vec![3; BLOCK_SIZE];
        let b = vec![3; BLOCK_SIZE];
        assert_eq!(Fingerprint::new(&a), Fingerprint::new(&b));
    }

    #[test]
    fn distinct_content_distinct_fingerprint() {
        let a = vec![3; BLOCK_SIZE];
        let mut b = vec![3; BLOCK_SIZE];
        b[0] = 4;
        assert_ne!(Fingerprint::new(&a), Fingerprint::new(&b));
    }

    #[test]
    fn zones_are_in_range() {
        for i in 0..64u8 {
            let fingerprint = Fingerprint::new(&vec![i; BLOCK_SIZE]);
            assert!(fingerprint.zone(3) < 3);
            assert!(logical_zone(i as Lbn, 5) < 5);
        }
    }
}
