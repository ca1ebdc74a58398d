//! Recovery-journal entries, block framing, and the lock counter.
//!
//! Every mapping change is appended to the recovery journal and committed to the reserved
//! metadata region before the write acknowledges. The journal is a circular log: block
//! sequence numbers grow forever, and sequence `s` lives in ring slot `s % ring`, so the tail
//! may only run `ring` blocks ahead of the head.
//!
//! The head may advance past a block only when the block's effects are durable, meaning every
//! increment *and* its paired decrement are reflected in the reference counts. Knowing this
//! without scanning is the job of the [`LockCounter`]: per journal block, a `journal` counter
//! plus per-zone `logical` and `physical` counter vectors. A block is locked iff any counter
//! is non-zero.
//!
//! This module holds the data: entry and block codecs and the lock counter. The thread that
//! owns the journal lives in [`zone::journal`](crate::zone::journal).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::block::{Lbn, Mapping, MappingState, BLOCK_SIZE};
use crate::error::{Error, Result};

/// The position of a journal entry: which block, and which entry within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPoint {
    /// The journal block's sequence number.
    pub sequence: u64,
    /// The entry index within the block.
    pub entry: usize,
}

/// One journaled mapping change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// The logical block whose mapping changed.
    pub lbn: Lbn,
    /// The mapping being replaced (its reference will be decremented).
    pub old: Mapping,
    /// The mapping being installed (its reference has been incremented).
    pub new: Mapping,
}

/// The encoded size of one entry.
const ENTRY_SIZE: usize = 28;

/// The encoded size of a journal block header: sequence, entry count, checksum.
const HEADER_SIZE: usize = 8 + 2 + 8;

/// The most entries one journal block can frame.
pub const fn max_entries_per_block() -> usize {
    (BLOCK_SIZE - HEADER_SIZE) / ENTRY_SIZE
}

/// Encode a journal block.
///
/// The layout is a little-endian header followed by the entries:
///
/// ```text
/// [sequence: u64] [count: u16] [checksum: u64] [count x entry]
/// entry = [lbn: u64] [old_pbn: u64] [old_state: u8 u8] [new_pbn: u64] [new_state: u8 u8]
/// ```
///
/// The checksum is seahash over everything after the checksum field, so a torn block write is
/// detected on replay.
pub fn encode_block(sequence: u64, entries: &[JournalEntry]) -> Vec<u8> {
    assert!(entries.len() <= max_entries_per_block());

    let mut buf = vec![0; BLOCK_SIZE];
    LittleEndian::write_u64(&mut buf[0..8], sequence);
    LittleEndian::write_u16(&mut buf[8..10], entries.len() as u16);

    let mut offset = HEADER_SIZE;
    for entry in entries {
        LittleEndian::write_u64(&mut buf[offset..offset + 8], entry.lbn);
        LittleEndian::write_u64(&mut buf[offset + 8..offset + 16], entry.old.pbn);
        buf[offset + 16..offset + 18].copy_from_slice(&entry.old.state.encode());
        LittleEndian::write_u64(&mut buf[offset + 18..offset + 26], entry.new.pbn);
        buf[offset + 26..offset + 28].copy_from_slice(&entry.new.state.encode());
        offset += ENTRY_SIZE;
    }

    let checksum = seahash::hash(&buf[18..]);
    LittleEndian::write_u64(&mut buf[10..18], checksum);
    buf
}

/// Decode a journal block.
///
/// Returns the sequence number and the entries. What replay would do with them is outside this
/// crate; the codec exists so the write path's output is a well-defined contract.
pub fn decode_block(buf: &[u8]) -> Result<(u64, Vec<JournalEntry>)> {
    if buf.len() != BLOCK_SIZE {
        return Err(Error::MetadataCorruption(format!(
            "journal block of {} bytes",
            buf.len()
        )));
    }

    let expected = LittleEndian::read_u64(&buf[10..18]);
    let found = seahash::hash(&buf[18..]);
    if expected != found {
        return Err(Error::MetadataCorruption(format!(
            "journal block checksum mismatch - expected {:x}, found {:x}",
            expected, found
        )));
    }

    let sequence = LittleEndian::read_u64(&buf[0..8]);
    let count = LittleEndian::read_u16(&buf[8..10]) as usize;
    if count > max_entries_per_block() {
        return Err(Error::MetadataCorruption(format!(
            "journal block claims {} entries",
            count
        )));
    }

    let mut entries = Vec::with_capacity(count);
    let mut offset = HEADER_SIZE;
    for _ in 0..count {
        let decode_state = |tag, slot| {
            MappingState::decode(tag, slot)
                .ok_or_else(|| Error::MetadataCorruption(format!("bad mapping state {}", tag)))
        };
        entries.push(JournalEntry {
            lbn: LittleEndian::read_u64(&buf[offset..offset + 8]),
            old: Mapping {
                pbn: LittleEndian::read_u64(&buf[offset + 8..offset + 16]),
                state: decode_state(buf[offset + 16], buf[offset + 17])?,
            },
            new: Mapping {
                pbn: LittleEndian::read_u64(&buf[offset + 18..offset + 26]),
                state: decode_state(buf[offset + 26], buf[offset + 27])?,
            },
        });
        offset += ENTRY_SIZE;
    }
    Ok((sequence, entries))
}

/// The per-journal-block reference counters.
///
/// Three counter classes per ring slot:
///
/// - `journal`: one per open entry in the block, held from append until the entry's
///   reference-count effects have been applied;
/// - `logical[z]`: outstanding block-map writes for the block, owned by logical zone `z`;
/// - `physical[z]`: outstanding reference-count decrements for the block, owned by physical
///   zone `z`.
///
/// Increments are plain read-modify-writes by the owning zone. Decrements are atomic and, on
/// reaching zero for a non-journal counter, set the owning zone's decrements-zeroed flag. When
/// the journal counter reaches zero the journal thread is notified and inspects the flags and
/// vectors to confirm the block is unlocked before advancing the head.
pub struct LockCounter {
    /// The ring size in blocks.
    ring: usize,
    /// The number of logical zones.
    logical_zones: usize,
    /// The number of physical zones.
    physical_zones: usize,
    /// Open-entry counters, one per ring slot.
    journal: Vec<AtomicU32>,
    /// Block-map write counters, `ring x logical_zones`.
    logical: Vec<AtomicU32>,
    /// Decrement counters, `ring x physical_zones`.
    physical: Vec<AtomicU32>,
    /// Decrements-zeroed flags, `ring x logical_zones`.
    logical_zeroed: Vec<AtomicBool>,
    /// Decrements-zeroed flags, `ring x physical_zones`.
    physical_zeroed: Vec<AtomicBool>,
}

impl LockCounter {
    /// A counter for a journal ring of `ring` blocks.
    pub fn new(ring: usize, logical_zones: usize, physical_zones: usize) -> LockCounter {
        let cells = |n| (0..n).map(|_| AtomicU32::new(0)).collect();
        let flags = |n| (0..n).map(|_| AtomicBool::new(true)).collect();
        LockCounter {
            ring,
            logical_zones,
            physical_zones,
            journal: cells(ring),
            logical: cells(ring * logical_zones),
            physical: cells(ring * physical_zones),
            logical_zeroed: flags(ring * logical_zones),
            physical_zeroed: flags(ring * physical_zones),
        }
    }

    /// The ring slot of a block sequence number.
    fn slot(&self, sequence: u64) -> usize {
        sequence as usize % self.ring
    }

    /// Add an open entry to block `sequence`. Journal thread only.
    pub fn journal_increment(&self, sequence: u64) {
        let slot = self.slot(sequence);
        let old = self.journal[slot].load(Ordering::Relaxed);
        self.journal[slot].store(old + 1, Ordering::Relaxed);
    }

    /// Close an entry of block `sequence`. Returns `true` if the journal counter reached zero.
    pub fn journal_decrement(&self, sequence: u64) -> bool {
        self.journal[self.slot(sequence)].fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Record an outstanding block-map write for `sequence` owned by logical zone `zone`.
    pub fn logical_increment(&self, sequence: u64, zone: usize) {
        let cell = self.slot(sequence) * self.logical_zones + zone;
        // Only zone `zone` touches this cell, so a plain read-modify-write suffices.
        let old = self.logical[cell].load(Ordering::Relaxed);
        self.logical[cell].store(old + 1, Ordering::Relaxed);
        self.logical_zeroed[cell].store(false, Ordering::Release);
    }

    /// Finish a block-map write for `sequence` owned by logical zone `zone`.
    pub fn logical_decrement(&self, sequence: u64, zone: usize) {
        let cell = self.slot(sequence) * self.logical_zones + zone;
        if self.logical[cell].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.logical_zeroed[cell].store(true, Ordering::Release);
        }
    }

    /// Record an outstanding reference decrement for `sequence` owned by physical zone `zone`.
    pub fn physical_increment(&self, sequence: u64, zone: usize) {
        let cell = self.slot(sequence) * self.physical_zones + zone;
        let old = self.physical[cell].load(Ordering::Relaxed);
        self.physical[cell].store(old + 1, Ordering::Relaxed);
        self.physical_zeroed[cell].store(false, Ordering::Release);
    }

    /// Finish a reference decrement for `sequence` owned by physical zone `zone`.
    pub fn physical_decrement(&self, sequence: u64, zone: usize) {
        let cell = self.slot(sequence) * self.physical_zones + zone;
        if self.physical[cell].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.physical_zeroed[cell].store(true, Ordering::Release);
        }
    }

    /// Is block `sequence` free of references?
    ///
    /// The journal thread calls this after a journal-counter zero notification; the per-zone
    /// flags and vectors confirm no zone still owes the block an update.
    pub fn is_unlocked(&self, sequence: u64) -> bool {
        let slot = self.slot(sequence);
        if self.journal[slot].load(Ordering::Acquire) != 0 {
            return false;
        }
        let logical_clear = (0..self.logical_zones).all(|zone| {
            let cell = slot * self.logical_zones + zone;
            self.logical_zeroed[cell].load(Ordering::Acquire)
                && self.logical[cell].load(Ordering::Acquire) == 0
        });
        let physical_clear = (0..self.physical_zones).all(|zone| {
            let cell = slot * self.physical_zones + zone;
            self.physical_zeroed[cell].load(Ordering::Acquire)
                && self.physical[cell].load(Ordering::Acquire) == 0
        });
        logical_clear && physical_clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Mapping;

    #[test]
    fn block_codec_inverse() {
        let entries = vec![
            JournalEntry {
                lbn: 7,
                old: Mapping::unmapped(),
                new: Mapping::uncompressed(19),
            },
            JournalEntry {
                lbn: 8,
                old: Mapping::uncompressed(19),
                new: Mapping::compressed(23, 5),
            },
            JournalEntry { lbn: 9, old: Mapping::zero(), new: Mapping::unmapped() },
        ];
        let buf = encode_block(3, &entries);
        assert_eq!(decode_block(&buf).unwrap(), (3, entries));
    }

    #[test]
    fn torn_block_detected() {
        let buf = encode_block(1, &[]);
        let mut torn = buf.clone();
        torn[100] ^= 1;
        assert!(decode_block(&torn).is_err());
    }

    #[test]
    fn empty_block_codec() {
        let buf = encode_block(0, &[]);
        assert_eq!(decode_block(&buf).unwrap(), (0, Vec::new()));
    }

    #[test]
    fn advanceable_iff_all_counters_zero() {
        let counter = LockCounter::new(4, 2, 2);
        assert!(counter.is_unlocked(0));

        counter.journal_increment(0);
        assert!(!counter.is_unlocked(0));

        counter.logical_increment(0, 1);
        counter.physical_increment(0, 0);
        assert!(!counter.is_unlocked(0));

        // Draining only some classes leaves the block locked.
        assert!(counter.journal_decrement(0));
        assert!(!counter.is_unlocked(0));
        counter.logical_decrement(0, 1);
        assert!(!counter.is_unlocked(0));

        counter.physical_decrement(0, 0);
        assert!(counter.is_unlocked(0));
    }

    #[test]
    fn ring_slots_are_independent() {
        let counter = LockCounter::new(4, 1, 1);
        counter.journal_increment(1);
        assert!(counter.is_unlocked(0));
        assert!(!counter.is_unlocked(1));
        // Sequence 5 shares slot 1 of the ring of 4.
        assert!(!counter.is_unlocked(5));
    }
}
