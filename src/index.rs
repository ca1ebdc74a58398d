//! The dedupe advice oracle.
//!
//! The oracle remembers where content with a given fingerprint was last stored, so a later
//! write of the same content can try to share that block instead of allocating a new one. Its
//! answers are *advice*, not truth: the advised block may since have been overwritten or freed,
//! which is why the hash lock verifies candidate blocks byte-for-byte before deduping against
//! them. A wrong answer costs a wasted read; a missing answer costs a duplicate block. Neither
//! affects correctness.
//!
//! The bundled implementation is a fixed-size table with one candidate per bucket and
//! replace-on-collision, owned by a hash zone and therefore lock-free. The trait is the seam
//! where a real deployment would hang an external index, applying its own query deadline and
//! answering `None` on expiry.

use crate::block::Pbn;
use crate::fingerprint::Fingerprint;

/// A dedupe advice oracle.
pub trait AdviceOracle: Send {
    /// Record that content with fingerprint `fingerprint` lives at `pbn`.
    fn post(&mut self, fingerprint: Fingerprint, pbn: Pbn);

    /// Look up advice for a fingerprint.
    fn query(&mut self, fingerprint: Fingerprint) -> Option<Pbn>;
}

/// A stored advice candidate.
#[derive(Clone, Copy)]
struct Candidate {
    /// The fingerprint the advice is for.
    fingerprint: Fingerprint,
    /// Where content with that fingerprint was last seen.
    pbn: Pbn,
}

/// The default number of buckets per advice table.
const DEFAULT_BUCKETS: usize = 1 << 14;

/// An in-memory advice table.
///
/// Heuristic in the sense that a duplicate may exist but not be found: there is no probing, so
/// a bucket collision simply replaces the older candidate. With buckets selected by independent
/// fingerprint bits this loses little in practice and keeps both operations O(1).
pub struct AdviceTable {
    /// The candidates, indexed by fingerprint bucket.
    buckets: Vec<Option<Candidate>>,
}

impl AdviceTable {
    /// Create an empty table with the default capacity.
    pub fn new() -> AdviceTable {
        AdviceTable::with_buckets(DEFAULT_BUCKETS)
    }

    /// Create an empty table with `buckets` buckets.
    pub fn with_buckets(buckets: usize) -> AdviceTable {
        AdviceTable { buckets: vec![None; buckets] }
    }
}

impl Default for AdviceTable {
    fn default() -> AdviceTable {
        AdviceTable::new()
    }
}

impl AdviceOracle for AdviceTable {
    fn post(&mut self, fingerprint: Fingerprint, pbn: Pbn) {
        let bucket = fingerprint.bucket(self.buckets.len());
        // Overwrite whatever candidate lived here; newer advice is more likely to still be
        // accurate.
        self.buckets[bucket] = Some(Candidate { fingerprint, pbn });
    }

    fn query(&mut self, fingerprint: Fingerprint) -> Option<Pbn> {
        let bucket = fingerprint.bucket(self.buckets.len());
        match self.buckets[bucket] {
            Some(candidate) if candidate.fingerprint == fingerprint => Some(candidate.pbn),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;

    #[test]
    fn post_then_query() {
        let mut table = AdviceTable::new();
        let fingerprint = Fingerprint::new(&vec![1; BLOCK_SIZE]);

        assert_eq!(table.query(fingerprint), None);
        table.post(fingerprint, 42);
        assert_eq!(table.query(fingerprint), Some(42));
    }

    #[test]
    fn newer_advice_wins() {
        let mut table = AdviceTable::new();
        let fingerprint = Fingerprint::new(&vec![2; BLOCK_SIZE]);

        table.post(fingerprint, 10);
        table.post(fingerprint, 20);
        assert_eq!(table.query(fingerprint), Some(20));
    }

    #[test]
    fn bucket_collision_replaces() {
        // With a single bucket, every post collides.
        let mut table = AdviceTable::with_buckets(1);
        let a = Fingerprint::new(&vec![1; BLOCK_SIZE]);
        let b = Fingerprint::new(&vec![2; BLOCK_SIZE]);

        table.post(a, 10);
        table.post(b, 20);
        assert_eq!(table.query(a), None);
        assert_eq!(table.query(b), Some(20));
    }
}
