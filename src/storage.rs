//! Backing storage.
//!
//! This module provides the primitive the rest of the device is built on: a flat array of
//! physical blocks with whole-block reads and writes. It acts similarly to `std::io::{Read,
//! Write}`, but is designed specifically for block devices: there are no partial transfers and
//! no positions, only block numbers.
//!
//! The device core never touches bytes outside this trait, which keeps the storage swappable:
//! tests run on [`RamStorage`], real deployments wrap a file or raw device in [`FileStorage`],
//! and fault injection is just another implementation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::block::{Pbn, BLOCK_SIZE};
use crate::error::{Error, Result};

/// A physical block store.
///
/// Implementations are shared between zone threads, so every operation takes `&self`; an
/// implementation with inner state guards it itself.
pub trait Storage: Send + Sync {
    /// The number of blocks on the store.
    fn blocks(&self) -> u64;

    /// Read block `pbn` into `buf`.
    ///
    /// `buf` must be exactly one block.
    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to block `pbn`.
    ///
    /// `buf` must be exactly one block.
    fn write_block(&self, pbn: Pbn, buf: &[u8]) -> Result<()>;

    /// Make every acknowledged write durable.
    fn flush(&self) -> Result<()>;

    /// Grow the store to `new_blocks` blocks.
    ///
    /// The new blocks read as zeroes. Shrinking is not supported; a smaller size is an error.
    fn grow(&self, new_blocks: u64) -> Result<()>;
}

/// Bounds-check a block access.
fn check(pbn: Pbn, limit: u64, buf: &[u8]) -> Result<()> {
    if pbn >= limit {
        return Err(Error::OutOfRange { block: pbn, limit });
    }
    if buf.len() != BLOCK_SIZE {
        return Err(Error::Io(format!("partial block transfer of {} bytes", buf.len())));
    }
    Ok(())
}

/// An in-memory block store.
///
/// The store the test suite runs on. It is also convenient as a scratch device for examples and
/// benchmarks, since it needs no setup and leaves nothing behind.
pub struct RamStorage {
    /// The backing bytes, one contiguous allocation of `blocks * BLOCK_SIZE`.
    bytes: Mutex<Vec<u8>>,
}

impl RamStorage {
    /// Create a zeroed store of `blocks` blocks.
    pub fn new(blocks: u64) -> RamStorage {
        RamStorage { bytes: Mutex::new(vec![0; blocks as usize * BLOCK_SIZE]) }
    }
}

impl Storage for RamStorage {
    fn blocks(&self) -> u64 {
        (self.bytes.lock().unwrap().len() / BLOCK_SIZE) as u64
    }

    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock().unwrap();
        check(pbn, (bytes.len() / BLOCK_SIZE) as u64, buf)?;
        let offset = pbn as usize * BLOCK_SIZE;
        buf.copy_from_slice(&bytes[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, pbn: Pbn, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        check(pbn, (bytes.len() / BLOCK_SIZE) as u64, buf)?;
        let offset = pbn as usize * BLOCK_SIZE;
        bytes[offset..offset + BLOCK_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Memory is as durable as it gets.
        Ok(())
    }

    fn grow(&self, new_blocks: u64) -> Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let old_blocks = (bytes.len() / BLOCK_SIZE) as u64;
        if new_blocks < old_blocks {
            return Err(Error::OutOfRange { block: new_blocks, limit: old_blocks });
        }
        bytes.resize(new_blocks as usize * BLOCK_SIZE, 0);
        Ok(())
    }
}

/// A block store over a file or raw device.
pub struct FileStorage {
    /// The backing file, positioned by each operation.
    file: Mutex<File>,
    /// The current size in blocks.
    ///
    /// Cached so `blocks()` does not have to stat the file; only `grow` changes it.
    blocks: AtomicU64,
}

impl FileStorage {
    /// Wrap an open file as a block store of `blocks` blocks.
    ///
    /// The file is extended to the full size up front, so later writes cannot run out of
    /// backing space halfway through.
    pub fn new(file: File, blocks: u64) -> Result<FileStorage> {
        file.set_len(blocks * BLOCK_SIZE as u64)?;
        Ok(FileStorage { file: Mutex::new(file), blocks: AtomicU64::new(blocks) })
    }
}

impl Storage for FileStorage {
    fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Acquire)
    }

    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> Result<()> {
        check(pbn, self.blocks(), buf)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, pbn: Pbn, buf: &[u8]) -> Result<()> {
        check(pbn, self.blocks(), buf)?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }

    fn grow(&self, new_blocks: u64) -> Result<()> {
        let old_blocks = self.blocks();
        if new_blocks < old_blocks {
            return Err(Error::OutOfRange { block: new_blocks, limit: old_blocks });
        }
        self.file.lock().unwrap().set_len(new_blocks * BLOCK_SIZE as u64)?;
        self.blocks.store(new_blocks, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trip() {
        let store = RamStorage::new(4);
        let block = vec![0xAB; BLOCK_SIZE];
        store.write_block(2, &block).unwrap();

        let mut read = vec![0; BLOCK_SIZE];
        store.read_block(2, &mut read).unwrap();
        assert_eq!(read, block);

        // Untouched blocks read as zeroes.
        store.read_block(3, &mut read).unwrap();
        assert!(read.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn ram_bounds() {
        let store = RamStorage::new(4);
        let mut buf = vec![0; BLOCK_SIZE];
        assert_eq!(
            store.read_block(4, &mut buf),
            Err(Error::OutOfRange { block: 4, limit: 4 })
        );
    }

    #[test]
    fn ram_rejects_partial_blocks() {
        let store = RamStorage::new(4);
        assert!(store.write_block(0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn ram_grow() {
        let store = RamStorage::new(2);
        store.grow(4).unwrap();
        assert_eq!(store.blocks(), 4);

        let mut buf = vec![0; BLOCK_SIZE];
        store.read_block(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&byte| byte == 0));

        // Shrinking is refused.
        assert!(store.grow(1).is_err());
    }
}
