//! A deduplicating, compressing virtual block device.
//!
//! This library presents a logical 4 KiB block device on top of a smaller physical block store.
//! Identical blocks are stored once, unique blocks are optionally compressed and packed together
//! into shared physical blocks, and every mapping change is journaled before it is acknowledged,
//! so that an external recovery pass can always reconstruct a consistent device.
//!
//! # Architecture
//!
//! The device is sharded into *zones*, each owned by exactly one OS thread:
//!
//! - *logical* zones own partitions of the logical address space: the LBN locks and the block
//!   map;
//! - *physical* zones own partitions of the physical address space: the slabs, their reference
//!   counts, and the data I/O against them;
//! - *hash* zones own partitions of the fingerprint space: the hash locks and the dedupe advice
//!   table;
//! - a single *journal* zone owns the recovery journal and its lock counter;
//! - a single *packer* zone bins compressed fragments into shared blocks;
//! - a pool of *CPU* workers does fingerprinting and compression;
//! - an *acknowledgement* zone completes requests and unwinds their locks.
//!
//! A zone's state is only ever touched by its own thread. All cross-zone coordination is message
//! passing over channels; the only shared mutable state on the write path is the per-request
//! atomic compression word and the journal lock counter, both of which exist precisely because
//! their signals must cross zones.
//!
//! The flow of a write is described in [`request`], the coordination protocol per content
//! fingerprint in [`zone::hash`], and the packing of compressed fragments in [`zone::packer`].

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;

pub mod block;
pub mod codec;
pub mod compression;
pub mod config;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod journal;
pub mod request;
pub mod storage;
pub mod zone;

pub use crate::block::{Lbn, Pbn, BLOCK_SIZE};
pub use crate::config::Config;
pub use crate::device::{Device, Stats};
pub use crate::error::{Error, Result};
pub use crate::request::{Ack, ReadAck};
pub use crate::storage::{FileStorage, RamStorage, Storage};
