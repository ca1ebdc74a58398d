//! End-to-end scenarios for the write path: dedupe, compression, mooting, and decrements.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vbd::{Config, Device, RamStorage, BLOCK_SIZE};

/// A root logger for tests.
fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Start a device over a fresh RAM store sized for the configuration.
fn device(config: Config) -> Device {
    let storage = Arc::new(RamStorage::new(config.physical_blocks));
    Device::new(config, storage, logger()).unwrap()
}

/// An incompressible random block.
fn random_block(rng: &mut StdRng) -> Vec<u8> {
    let mut block = vec![0; BLOCK_SIZE];
    rng.fill(&mut block[..]);
    block
}

/// A compressible block distinguishable by its tag.
fn compressible_block(tag: u8) -> Vec<u8> {
    let mut block = vec![tag; BLOCK_SIZE];
    for (i, byte) in block.iter_mut().enumerate() {
        if i % 97 == 0 {
            *byte = (i / 97) as u8;
        }
    }
    block
}

#[test]
fn simple_unique_writes() {
    let mut config = Config::with_blocks(64, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(1);
    let payloads: Vec<_> = (0..10).map(|_| random_block(&mut rng)).collect();

    for (lbn, payload) in payloads.iter().enumerate() {
        device.write(lbn as u64, payload).wait().unwrap();
        let read = device.read(lbn as u64).wait().unwrap();
        assert_eq!(&read[..], &payload[..]);
    }

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 10);
    assert_eq!(stats.physical_blocks_free, 64 - stats.overhead - 10);
    assert_eq!(stats.logical_blocks_used, 10);
}

#[test]
fn exact_duplicate() {
    let mut config = Config::with_blocks(64, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(2);
    let payload = random_block(&mut rng);

    device.write(5, &payload).wait().unwrap();
    device.write(7, &payload).wait().unwrap();

    assert_eq!(&device.read(5).wait().unwrap()[..], &payload[..]);
    assert_eq!(&device.read(7).wait().unwrap()[..], &payload[..]);

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 1);
    assert!(stats.dedupe_hits >= 1);
}

#[test]
fn compressed_pair_shares_a_block() {
    let mut config = Config::with_blocks(64, 64);
    config.slots_per_bin = 2;
    // Keep the age deadline out of the picture; the bin flushes by filling.
    config.packer_bin_age = Duration::from_secs(30);
    let device = device(config);

    let a = compressible_block(0xA0);
    let b = compressible_block(0xB0);

    // Submit both before waiting: the second fragment fills the two-slot bin and flushes
    // it, which is what completes the first.
    let ack_a = device.write(3, &a);
    let ack_b = device.write(4, &b);
    ack_a.wait().unwrap();
    ack_b.wait().unwrap();

    assert_eq!(&device.read(3).wait().unwrap()[..], &a[..]);
    assert_eq!(&device.read(4).wait().unwrap()[..], &b[..]);

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 1);
    assert_eq!(stats.packed_blocks, 1);
    assert_eq!(stats.packed_fragments, 2);
}

#[test]
fn mooted_compressor_write() {
    let mut config = Config::with_blocks(64, 64);
    // A roomy bin and a long deadline park the first write in the packer.
    config.packer_bin_age = Duration::from_secs(30);
    let device = device(config);

    // The first write is compressible, so it parks in the packer; the second is random, so
    // its own acknowledgement does not depend on any bin filling up.
    let first = compressible_block(1);
    let second = random_block(&mut StdRng::seed_from_u64(4));

    let ack_first = device.write(1, &first);
    // Give the first write time to park in a bin; the moot is correct in any interleaving,
    // this just makes the interesting one overwhelmingly likely.
    thread::sleep(Duration::from_millis(100));
    let ack_second = device.write(1, &second);

    ack_first.wait().unwrap();
    ack_second.wait().unwrap();

    assert_eq!(&device.read(1).wait().unwrap()[..], &second[..]);

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 1);
    // Nothing was ever packed: the first write fell back to an uncompressed block.
    assert_eq!(stats.packed_blocks, 0);
}

#[test]
fn overwrite_releases_replaced_blocks() {
    let mut config = Config::with_blocks(28, 64);
    config.compression = false;
    config.physical_zones = 1;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(5);

    // Fill every LBN with unique content.
    for lbn in 0..28 {
        device.write(lbn, &random_block(&mut rng)).wait().unwrap();
    }
    device.quiesce();
    assert_eq!(device.stats().physical_blocks_allocated, 28);

    // Overwrite half with fresh unique content.
    let replacements: Vec<_> = (0..14).map(|_| random_block(&mut rng)).collect();
    for (lbn, payload) in replacements.iter().enumerate() {
        device.write(lbn as u64, payload).wait().unwrap();
    }
    device.quiesce();

    // The replaced blocks' decrements have run: only the live blocks remain allocated.
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 28);
    assert_eq!(stats.physical_blocks_free, 64 - stats.overhead - 28);

    for (lbn, payload) in replacements.iter().enumerate() {
        assert_eq!(&device.read(lbn as u64).wait().unwrap()[..], &payload[..]);
    }
}

#[test]
fn stale_dedupe_advice_falls_through() {
    let mut config = Config::with_blocks(64, 64);
    config.compression = false;
    config.physical_zones = 1;
    config.logical_zones = 1;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(6);
    let original = random_block(&mut rng);
    let replacement = random_block(&mut rng);
    let squatter = random_block(&mut rng);

    // Post advice for the original's fingerprint, then invalidate it: overwrite the LBN so
    // the advised block is freed, and write new content so the block is reused.
    device.write(5, &original).wait().unwrap();
    device.write(5, &replacement).wait().unwrap();
    device.quiesce();
    device.write(6, &squatter).wait().unwrap();
    device.quiesce();

    // The oracle still advises the original's fingerprint at the reused block; verification
    // reads the squatter's bytes, fails, and the write takes its own block.
    device.write(2, &original).wait().unwrap();
    assert_eq!(&device.read(2).wait().unwrap()[..], &original[..]);

    device.quiesce();
    let stats = device.stats();
    // Replacement, squatter, and the original's second copy are all live.
    assert_eq!(stats.physical_blocks_allocated, 3);
    assert_eq!(stats.dedupe_hits, 0);
}

#[test]
fn concurrent_identical_writes_share_one_block() {
    let mut config = Config::with_blocks(64, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(7);
    let payload = random_block(&mut rng);

    // Submit them all before waiting so some land in a shared hash lock as waiters.
    let acks: Vec<_> = (0..8).map(|lbn| device.write(lbn, &payload)).collect();
    for ack in acks {
        ack.wait().unwrap();
    }

    for lbn in 0..8 {
        assert_eq!(&device.read(lbn).wait().unwrap()[..], &payload[..]);
    }

    device.quiesce();
    assert_eq!(device.stats().physical_blocks_allocated, 1);
}

#[test]
fn writes_to_one_lbn_apply_in_order() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(8);
    let payloads: Vec<_> = (0..16).map(|_| random_block(&mut rng)).collect();

    // Pipeline every write to the same LBN; the LBN lock queues them FIFO.
    let acks: Vec<_> = payloads.iter().map(|payload| device.write(9, payload)).collect();
    for ack in acks {
        ack.wait().unwrap();
    }

    let last = payloads.last().unwrap();
    assert_eq!(&device.read(9).wait().unwrap()[..], &last[..]);

    device.quiesce();
    assert_eq!(device.stats().physical_blocks_allocated, 1);
}

#[test]
fn zero_blocks_occupy_no_storage() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    device.write(3, &vec![0; BLOCK_SIZE]).wait().unwrap();

    let read = device.read(3).wait().unwrap();
    assert!(read.iter().all(|&byte| byte == 0));

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 0);
    assert_eq!(stats.logical_blocks_used, 1);
}

#[test]
fn trim_unmaps_and_frees() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(9);
    for lbn in 0..4 {
        device.write(lbn, &random_block(&mut rng)).wait().unwrap();
    }

    // A multi-block trim is split per block and acknowledged once.
    device.trim(0, 4).wait().unwrap();
    device.quiesce();

    for lbn in 0..4 {
        let read = device.read(lbn).wait().unwrap();
        assert!(read.iter().all(|&byte| byte == 0));
    }
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 0);
    assert_eq!(stats.logical_blocks_used, 0);
}

#[test]
fn dedupe_absorbs_writes_on_a_full_device() {
    // Two data blocks in one slab.
    let mut config = Config::with_blocks(16, 4);
    config.journal_blocks = 2;
    config.physical_zones = 1;
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(10);
    let first = random_block(&mut rng);
    let second = random_block(&mut rng);
    let third = random_block(&mut rng);

    device.write(0, &first).wait().unwrap();
    device.write(1, &second).wait().unwrap();

    // The device is full: unique content cannot land.
    assert_eq!(device.write(2, &third).wait(), Err(vbd::Error::NoSpace));

    // Duplicate content still can.
    device.write(3, &first).wait().unwrap();
    assert_eq!(&device.read(3).wait().unwrap()[..], &first[..]);

    device.quiesce();
    assert_eq!(device.stats().physical_blocks_allocated, 2);
}

#[test]
fn fua_write_round_trips() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = true;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(11);
    let payload = random_block(&mut rng);

    // FUA bypasses compression entirely and flushes the journal before acknowledging.
    device.write_fua(2, &payload).wait().unwrap();
    assert_eq!(&device.read(2).wait().unwrap()[..], &payload[..]);

    device.quiesce();
    let stats = device.stats();
    assert_eq!(stats.physical_blocks_allocated, 1);
    assert_eq!(stats.packed_blocks, 0);
}

#[test]
fn flush_acknowledges_after_journaling() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(12);
    device.write(0, &random_block(&mut rng)).wait().unwrap();
    device.flush().wait().unwrap();
}
