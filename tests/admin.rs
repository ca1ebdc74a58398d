//! Administrative surface: suspend/resume, grow, switches, limits, and read-only mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vbd::{Config, Device, Error, Pbn, RamStorage, Storage, BLOCK_SIZE};

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn device(config: Config) -> Device {
    let storage = Arc::new(RamStorage::new(config.physical_blocks));
    Device::new(config, storage, logger()).unwrap()
}

fn random_block(rng: &mut StdRng) -> Vec<u8> {
    let mut block = vec![0; BLOCK_SIZE];
    rng.fill(&mut block[..]);
    block
}

/// A RAM store that fails writes to low block numbers on demand, to provoke metadata
/// failures without touching data blocks.
struct FaultyStorage {
    inner: RamStorage,
    /// Writes to PBNs below this fail.
    fail_below: AtomicU64,
}

impl FaultyStorage {
    fn new(blocks: u64) -> FaultyStorage {
        FaultyStorage { inner: RamStorage::new(blocks), fail_below: AtomicU64::new(0) }
    }

    fn fail_metadata_writes(&self, region: u64) {
        self.fail_below.store(region, Ordering::Release);
    }
}

impl Storage for FaultyStorage {
    fn blocks(&self) -> u64 {
        self.inner.blocks()
    }

    fn read_block(&self, pbn: Pbn, buf: &mut [u8]) -> vbd::Result<()> {
        self.inner.read_block(pbn, buf)
    }

    fn write_block(&self, pbn: Pbn, buf: &[u8]) -> vbd::Result<()> {
        if pbn < self.fail_below.load(Ordering::Acquire) {
            return Err(Error::Io("injected metadata fault".into()));
        }
        self.inner.write_block(pbn, buf)
    }

    fn flush(&self) -> vbd::Result<()> {
        self.inner.flush()
    }

    fn grow(&self, new_blocks: u64) -> vbd::Result<()> {
        self.inner.grow(new_blocks)
    }
}

#[test]
fn suspend_blocks_io_and_resume_restores_it() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(20);
    let payload = random_block(&mut rng);
    device.write(0, &payload).wait().unwrap();

    device.suspend(true).unwrap();
    assert!(matches!(
        device.write(1, &payload).wait(),
        Err(Error::InvalidAdminState { .. })
    ));
    assert!(matches!(device.suspend(false), Err(Error::InvalidAdminState { .. })));

    device.resume().unwrap();
    device.write(1, &payload).wait().unwrap();
    assert_eq!(&device.read(0).wait().unwrap()[..], &payload[..]);
}

#[test]
fn grow_logical_needs_matching_preparation() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(21);
    let payload = random_block(&mut rng);

    // Out of range until grown.
    assert!(matches!(device.write(20, &payload).wait(), Err(Error::OutOfRange { .. })));

    device.prepare_to_grow_logical(32).unwrap();
    device.suspend(true).unwrap();

    assert_eq!(
        device.grow_logical(48),
        Err(Error::ParameterMismatch { prepared: 32, applied: 48 })
    );
    device.grow_logical(32).unwrap();
    device.resume().unwrap();

    device.write(20, &payload).wait().unwrap();
    assert_eq!(&device.read(20).wait().unwrap()[..], &payload[..]);
    assert_eq!(device.stats().logical_blocks, 32);
}

#[test]
fn grow_logical_requires_suspension_and_preparation() {
    let first = device(Config::with_blocks(16, 64));

    first.prepare_to_grow_logical(32).unwrap();
    assert!(matches!(first.grow_logical(32), Err(Error::InvalidAdminState { .. })));

    let second = device(Config::with_blocks(16, 64));
    second.suspend(false).unwrap();
    assert!(matches!(second.grow_logical(32), Err(Error::InvalidAdminState { .. })));
}

#[test]
fn grow_physical_extends_the_data_region() {
    // A deliberately tiny device: 4 data blocks.
    let mut config = Config::with_blocks(32, 12);
    config.compression = false;
    config.physical_zones = 1;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(22);
    let payloads: Vec<_> = (0..8).map(|_| random_block(&mut rng)).collect();

    for (lbn, payload) in payloads.iter().take(4).enumerate() {
        device.write(lbn as u64, payload).wait().unwrap();
    }
    // Full.
    assert_eq!(device.write(4, &payloads[4]).wait(), Err(Error::NoSpace));

    device.prepare_to_grow_physical(24).unwrap();
    device.suspend(true).unwrap();
    device.grow_physical(24).unwrap();
    device.resume().unwrap();

    for (lbn, payload) in payloads.iter().enumerate().skip(4) {
        device.write(lbn as u64, payload).wait().unwrap();
    }
    device.quiesce();

    for (lbn, payload) in payloads.iter().enumerate() {
        assert_eq!(&device.read(lbn as u64).wait().unwrap()[..], &payload[..]);
    }
    let stats = device.stats();
    assert_eq!(stats.physical_blocks, 24);
    assert_eq!(stats.physical_blocks_allocated, 8);
}

#[test]
fn switches_disable_dedupe_and_compression() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let device = device(config);

    let mut rng = StdRng::seed_from_u64(23);
    let payload = random_block(&mut rng);

    device.set_dedupe(false);
    device.write(0, &payload).wait().unwrap();
    device.write(1, &payload).wait().unwrap();
    device.quiesce();

    // Without the oracle, identical content lands twice.
    assert_eq!(device.stats().physical_blocks_allocated, 2);
    assert_eq!(device.stats().dedupe_queries, 0);
}

#[test]
fn payload_must_be_one_block() {
    let device = device(Config::with_blocks(16, 64));
    assert!(device.write(0, &[1, 2, 3]).wait().is_err());
}

#[test]
fn out_of_range_is_rejected_up_front() {
    let device = device(Config::with_blocks(16, 64));
    assert!(matches!(
        device.read(16).wait(),
        Err(Error::OutOfRange { block: 16, limit: 16 })
    ));
    assert!(matches!(device.trim(8, 16).wait(), Err(Error::OutOfRange { .. })));
}

#[test]
fn metadata_failure_enters_read_only_mode() {
    let mut config = Config::with_blocks(16, 64);
    config.compression = false;
    let storage = Arc::new(FaultyStorage::new(64));
    let journal_region = config.journal_blocks;
    let device = Device::new(config, Arc::clone(&storage) as Arc<dyn Storage>, logger())
        .unwrap();

    let mut rng = StdRng::seed_from_u64(24);
    let payload = random_block(&mut rng);
    device.write(0, &payload).wait().unwrap();

    // Break the journal region: the next journaled write fails and trips read-only mode.
    storage.fail_metadata_writes(journal_region);
    assert_eq!(device.write(1, &payload).wait(), Err(Error::ReadOnly));
    assert!(device.stats().read_only);

    // Writes now fail immediately; reads continue.
    assert_eq!(device.write(2, &payload).wait(), Err(Error::ReadOnly));
    assert_eq!(device.trim(0, 1).wait(), Err(Error::ReadOnly));
    assert_eq!(&device.read(0).wait().unwrap()[..], &payload[..]);

    // The failed write changed nothing.
    let read = device.read(1).wait().unwrap();
    assert!(read.iter().all(|&byte| byte == 0));
}
