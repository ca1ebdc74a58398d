//! Block addressing and mapping states.
//!
//! The device operates on fixed 4 KiB blocks. Logical block numbers (LBNs) index the virtual
//! device the host sees; physical block numbers (PBNs) index the backing store. PBN 0 is never
//! handed out by the allocator and doubles as the "no block" sentinel, so a mapping whose state
//! carries no storage (zero or unmapped) always has PBN 0.

use std::fmt;

/// The block size in bytes.
///
/// Both logical and physical blocks are this size. All host payloads must be exactly one block;
/// trims may span several blocks and are split before they enter the data path.
pub const BLOCK_SIZE: usize = 4096;

/// A logical block number.
pub type Lbn = u64;

/// A physical block number.
pub type Pbn = u64;

/// The "no block" PBN.
pub const ZERO_PBN: Pbn = 0;

/// A block-sized data buffer.
pub type BlockBuf = Box<[u8]>;

/// Copy a host payload into an owned block buffer.
///
/// The caller must have validated that `payload` is exactly one block long.
pub fn buf_from(payload: &[u8]) -> BlockBuf {
    debug_assert_eq!(payload.len(), BLOCK_SIZE);
    payload.to_vec().into_boxed_slice()
}

/// An all-zero block buffer.
pub fn zero_buf() -> BlockBuf {
    vec![0; BLOCK_SIZE].into_boxed_slice()
}

/// Check whether a payload is all zeroes.
///
/// Zero blocks never reach the allocator, the hash locks, or the packer; they map to the
/// distinguished zero state instead of occupying storage.
pub fn is_zero(payload: &[u8]) -> bool {
    payload.iter().all(|&byte| byte == 0)
}

/// The interpretation of a mapped physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// The LBN has never been written, or has been trimmed.
    Unmapped,
    /// The LBN maps to a whole physical block.
    Uncompressed,
    /// The LBN maps to one compressed fragment of a shared physical block.
    ///
    /// The slot selects the fragment within the packed block.
    Compressed(u8),
    /// The LBN holds all zeroes and occupies no storage.
    Zero,
}

impl MappingState {
    /// Encode the state as a pair of bytes for journal entries.
    pub fn encode(self) -> [u8; 2] {
        match self {
            MappingState::Unmapped => [0, 0],
            MappingState::Uncompressed => [1, 0],
            MappingState::Compressed(slot) => [2, slot],
            MappingState::Zero => [3, 0],
        }
    }

    /// Decode a state from its journal encoding.
    pub fn decode(tag: u8, slot: u8) -> Option<MappingState> {
        match tag {
            0 => Some(MappingState::Unmapped),
            1 => Some(MappingState::Uncompressed),
            2 => Some(MappingState::Compressed(slot)),
            3 => Some(MappingState::Zero),
            _ => None,
        }
    }
}

/// A block-map entry: where a logical block lives and how to read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// The physical block, or `ZERO_PBN` when the state carries no storage.
    pub pbn: Pbn,
    /// How to interpret the physical block.
    pub state: MappingState,
}

impl Mapping {
    /// The mapping of a never-written or trimmed LBN.
    pub fn unmapped() -> Mapping {
        Mapping { pbn: ZERO_PBN, state: MappingState::Unmapped }
    }

    /// The mapping of an all-zero LBN.
    pub fn zero() -> Mapping {
        Mapping { pbn: ZERO_PBN, state: MappingState::Zero }
    }

    /// A mapping to a whole physical block.
    pub fn uncompressed(pbn: Pbn) -> Mapping {
        Mapping { pbn, state: MappingState::Uncompressed }
    }

    /// A mapping to a fragment of a shared compressed block.
    pub fn compressed(pbn: Pbn, slot: u8) -> Mapping {
        Mapping { pbn, state: MappingState::Compressed(slot) }
    }

    /// Does this mapping hold a reference on real storage?
    ///
    /// Exactly the mappings for which reference-count increments and decrements are issued.
    pub fn is_counted(&self) -> bool {
        match self.state {
            MappingState::Uncompressed | MappingState::Compressed(_) => true,
            MappingState::Unmapped | MappingState::Zero => false,
        }
    }

    /// Does a read of this mapping return zeroes without touching storage?
    pub fn reads_as_zero(&self) -> bool {
        !self.is_counted()
    }
}

impl Default for Mapping {
    fn default() -> Mapping {
        Mapping::unmapped()
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.state {
            MappingState::Unmapped => write!(f, "unmapped"),
            MappingState::Zero => write!(f, "zero"),
            MappingState::Uncompressed => write!(f, "pbn {}", self.pbn),
            MappingState::Compressed(slot) => write!(f, "pbn {} slot {}", self.pbn, slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_detection() {
        assert!(is_zero(&[0; BLOCK_SIZE]));

        let mut buf = [0; BLOCK_SIZE];
        buf[BLOCK_SIZE - 1] = 1;
        assert!(!is_zero(&buf));
    }

    #[test]
    fn state_codec_inverse() {
        for state in [
            MappingState::Unmapped,
            MappingState::Uncompressed,
            MappingState::Compressed(0),
            MappingState::Compressed(13),
            MappingState::Zero,
        ] {
            let [tag, slot] = state.encode();
            assert_eq!(MappingState::decode(tag, slot), Some(state));
        }

        assert_eq!(MappingState::decode(9, 0), None);
    }

    #[test]
    fn counted_states() {
        assert!(!Mapping::unmapped().is_counted());
        assert!(!Mapping::zero().is_counted());
        assert!(Mapping::uncompressed(5).is_counted());
        assert!(Mapping::compressed(5, 2).is_counted());
    }
}
