//! Compression and packed-block framing.
//!
//! # Compression
//!
//! The codec is LZ4. The device never interprets compressed bytes; it only needs to know their
//! length, to decide whether a fragment is worth packing, and to get the original block back on
//! the read path.
//!
//! # Packed blocks
//!
//! A packed block is one physical block holding several compressed fragments. The framing is a
//! little-endian header followed by the fragment bytes:
//!
//! ```text
//! [count: u16] [count x (offset: u16, length: u16)] [fragment bytes ...]
//! ```
//!
//! Offsets are relative to the end of the header for the maximal slot count, so a reader does
//! not need to know how many slots the writer was configured with. A mapping to a fragment
//! carries the slot number, never an offset, which keeps the block map independent of this
//! framing.

use byteorder::{ByteOrder, LittleEndian};

use crate::block::BLOCK_SIZE;
use crate::error::{Error, Result};

/// The maximum number of fragments in a packed block.
pub const MAX_SLOTS: usize = 14;

/// The size of the packed-block header.
///
/// Sized for `MAX_SLOTS` regardless of configuration, so the payload offsets are stable.
const HEADER_SIZE: usize = 2 + MAX_SLOTS * 4;

/// The number of payload bytes a packed block can hold.
pub fn payload_capacity() -> usize {
    BLOCK_SIZE - HEADER_SIZE
}

/// Compress one block.
///
/// Returns the compressed bytes, which the caller compares against [`payload_capacity`] to
/// decide whether packing is worthwhile. Incompressible data simply comes back bigger than the
/// capacity and takes the uncompressed path; there is no error case.
pub fn compress(block: &[u8]) -> Vec<u8> {
    lz4_compress::compress(block)
}

/// Decompress one fragment back into a whole block.
pub fn decompress(fragment: &[u8]) -> Result<Vec<u8>> {
    let block = lz4_compress::decompress(fragment)
        .map_err(|err| Error::MetadataCorruption(format!("bad compressed fragment: {:?}", err)))?;
    if block.len() != BLOCK_SIZE {
        return Err(Error::MetadataCorruption(format!(
            "compressed fragment expanded to {} bytes",
            block.len()
        )));
    }
    Ok(block)
}

/// Assemble a packed block from compressed fragments.
///
/// Fragment `i` becomes slot `i`. The caller (the packer) has already checked that the
/// fragments fit; a violation here is a logic error, not an I/O condition.
pub fn encode_packed(fragments: &[&[u8]]) -> Vec<u8> {
    assert!(fragments.len() >= 2, "a packed block needs at least two fragments");
    assert!(fragments.len() <= MAX_SLOTS, "too many fragments for one packed block");

    let mut block = vec![0; BLOCK_SIZE];
    LittleEndian::write_u16(&mut block[0..2], fragments.len() as u16);

    let mut offset = 0usize;
    for (slot, fragment) in fragments.iter().enumerate() {
        let field = 2 + slot * 4;
        LittleEndian::write_u16(&mut block[field..field + 2], offset as u16);
        LittleEndian::write_u16(&mut block[field + 2..field + 4], fragment.len() as u16);
        block[HEADER_SIZE + offset..HEADER_SIZE + offset + fragment.len()]
            .copy_from_slice(fragment);
        offset += fragment.len();
    }
    assert!(offset <= payload_capacity(), "fragments overflow the packed block");

    block
}

/// Extract one compressed fragment from a packed block.
pub fn packed_fragment(block: &[u8], slot: u8) -> Result<&[u8]> {
    let count = LittleEndian::read_u16(&block[0..2]) as usize;
    if count < 2 || count > MAX_SLOTS {
        return Err(Error::MetadataCorruption(format!(
            "packed block claims {} fragments",
            count
        )));
    }
    if slot as usize >= count {
        return Err(Error::MetadataCorruption(format!(
            "slot {} out of range of {} fragments",
            slot, count
        )));
    }

    let field = 2 + slot as usize * 4;
    let offset = LittleEndian::read_u16(&block[field..field + 2]) as usize;
    let length = LittleEndian::read_u16(&block[field + 2..field + 4]) as usize;
    if offset + length > payload_capacity() {
        return Err(Error::MetadataCorruption(format!(
            "fragment {} spans {}..{} past the payload region",
            slot,
            offset,
            offset + length
        )));
    }

    Ok(&block[HEADER_SIZE + offset..HEADER_SIZE + offset + length])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A compressible test block: long runs with a distinguishing tag.
    fn compressible(tag: u8) -> Vec<u8> {
        let mut block = vec![tag; BLOCK_SIZE];
        for (i, byte) in block.iter_mut().enumerate() {
            if i % 97 == 0 {
                *byte = (i / 97) as u8;
            }
        }
        block
    }

    #[test]
    fn compress_round_trip() {
        let block = compressible(7);
        let fragment = compress(&block);
        assert!(fragment.len() < payload_capacity());
        assert_eq!(decompress(&fragment).unwrap(), block);
    }

    #[test]
    fn pack_and_unpack() {
        let blocks: Vec<_> = (0..3u8).map(compressible).collect();
        let fragments: Vec<_> = blocks.iter().map(|block| compress(block)).collect();
        let refs: Vec<&[u8]> = fragments.iter().map(|f| &f[..]).collect();

        let packed = encode_packed(&refs);
        assert_eq!(packed.len(), BLOCK_SIZE);

        for (slot, block) in blocks.iter().enumerate() {
            let fragment = packed_fragment(&packed, slot as u8).unwrap();
            assert_eq!(&decompress(fragment).unwrap(), block);
        }
    }

    #[test]
    fn rejects_out_of_range_slot() {
        let blocks: Vec<_> = (0..2u8).map(compressible).collect();
        let fragments: Vec<_> = blocks.iter().map(|block| compress(block)).collect();
        let refs: Vec<&[u8]> = fragments.iter().map(|f| &f[..]).collect();

        let packed = encode_packed(&refs);
        assert!(packed_fragment(&packed, 2).is_err());
    }

    #[test]
    fn rejects_corrupt_header() {
        let mut block = vec![0; BLOCK_SIZE];
        // A fragment count past MAX_SLOTS.
        block[0] = 0xFF;
        assert!(packed_fragment(&block, 0).is_err());
    }

    #[test]
    fn rejects_torn_fragment() {
        let fragment = compress(&compressible(3));
        let torn = &fragment[..fragment.len() / 2];
        assert!(decompress(torn).is_err());
    }
}
