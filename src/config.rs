//! Device configuration.
//!
//! The configuration fixes the shape of the device: the logical and physical dimensions, the
//! zone counts of the thread fabric, the journal geometry, and the packer tuning. It is
//! validated once when the device is constructed and is immutable afterwards, with the
//! exceptions of the logical/physical dimensions (grown through the admin interface) and the
//! compression/dedupe switches (toggled through the admin interface).

use std::time::Duration;

use crate::codec;
use crate::error::{Error, Result};
use crate::journal;

/// The construction parameters of a device.
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of logical blocks the host sees.
    pub logical_blocks: u64,
    /// The number of physical blocks on the backing store.
    ///
    /// The first `journal_blocks` of them are reserved for the recovery journal; the rest is
    /// the data region, carved into one slab per physical zone.
    pub physical_blocks: u64,
    /// The number of logical zones (threads owning LBN partitions).
    pub logical_zones: usize,
    /// The number of physical zones (threads owning slabs).
    pub physical_zones: usize,
    /// The number of hash zones (threads owning fingerprint partitions).
    pub hash_zones: usize,
    /// The number of CPU workers for fingerprinting and compression.
    pub cpu_workers: usize,
    /// The number of physical blocks reserved for the recovery journal.
    pub journal_blocks: u64,
    /// The number of entries a journal block holds before the tail moves on.
    pub journal_entries_per_block: usize,
    /// The maximum number of compressed fragments packed into one physical block.
    pub slots_per_bin: usize,
    /// How long a partially filled packer bin may stay open before it is flushed.
    ///
    /// The deadline bounds the latency of compressed writes that never see enough traffic to
    /// fill their bin. The host configures it; there is no universally right value.
    pub packer_bin_age: Duration,
    /// Whether compression starts enabled.
    pub compression: bool,
    /// Whether deduplication starts enabled.
    pub dedupe: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            logical_blocks: 0,
            physical_blocks: 0,
            logical_zones: 2,
            physical_zones: 2,
            hash_zones: 2,
            cpu_workers: 2,
            journal_blocks: 8,
            journal_entries_per_block: 128,
            slots_per_bin: codec::MAX_SLOTS,
            packer_bin_age: Duration::from_millis(500),
            compression: true,
            dedupe: true,
        }
    }
}

impl Config {
    /// A configuration with the given dimensions and defaults for everything else.
    pub fn with_blocks(logical_blocks: u64, physical_blocks: u64) -> Config {
        Config { logical_blocks, physical_blocks, ..Config::default() }
    }

    /// The first PBN of the data region.
    ///
    /// PBN 0 is the "no block" sentinel, so the journal occupies PBNs `0..journal_blocks` with
    /// its ring living in blocks `1..journal_blocks`, and data starts right after.
    pub fn data_start(&self) -> u64 {
        self.journal_blocks
    }

    /// The number of physical blocks available for data.
    pub fn data_blocks(&self) -> u64 {
        self.physical_blocks - self.journal_blocks
    }

    /// Validate the configuration.
    ///
    /// Rejects shapes the fabric cannot run on: empty dimensions, zero zone counts, a journal
    /// that leaves no data region, or packer slots beyond what the packed-block framing can
    /// address.
    pub fn validate(&self) -> Result<()> {
        if self.logical_blocks == 0 {
            return Err(Error::InvalidAdminState { operation: "start with zero logical blocks" });
        }
        if self.logical_zones == 0
            || self.physical_zones == 0
            || self.hash_zones == 0
            || self.cpu_workers == 0
        {
            return Err(Error::InvalidAdminState { operation: "start with zero zones" });
        }
        // The journal ring needs at least two blocks so the tail can move while the head is
        // still locked, and the data region needs at least one block per physical zone.
        if self.journal_blocks < 2 {
            return Err(Error::InvalidAdminState { operation: "start with no journal" });
        }
        if self.physical_blocks < self.journal_blocks + self.physical_zones as u64 {
            return Err(Error::OutOfRange {
                block: self.physical_blocks,
                limit: self.journal_blocks + self.physical_zones as u64,
            });
        }
        if self.slots_per_bin < 2 || self.slots_per_bin > codec::MAX_SLOTS {
            return Err(Error::InvalidAdminState { operation: "start with invalid bin slots" });
        }
        if self.journal_entries_per_block == 0
            || self.journal_entries_per_block > journal::max_entries_per_block()
        {
            return Err(Error::InvalidAdminState { operation: "start with invalid journal shape" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shape_is_valid() {
        let config = Config::with_blocks(1024, 256);
        config.validate().unwrap();
        assert_eq!(config.data_blocks(), 256 - config.journal_blocks);
    }

    #[test]
    fn rejects_empty_device() {
        assert!(Config::with_blocks(0, 64).validate().is_err());
    }

    #[test]
    fn rejects_journal_swallowing_device() {
        let mut config = Config::with_blocks(64, 8);
        config.journal_blocks = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unaddressable_slots() {
        let mut config = Config::with_blocks(64, 64);
        config.slots_per_bin = codec::MAX_SLOTS + 1;
        assert!(config.validate().is_err());

        config.slots_per_bin = 1;
        assert!(config.validate().is_err());
    }
}
