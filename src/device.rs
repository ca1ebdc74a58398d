//! The assembled device.
//!
//! [`Device`] wires the zone fabric together and exposes the two outward faces of the system:
//! the host interface (`read`, `write`, `trim`, `flush`) and the admin interface (`suspend`,
//! `resume`, grow, feature switches, statistics). Everything in between happens on the zone
//! threads; the methods here only validate, wrap the operation in a request, and hand it to
//! the owning zone.
//!
//! The [`Shared`] structure is the state every zone can see: the router, the backing store,
//! the statistics counters, the journal lock counter, and the handful of device-wide atomic
//! switches (read-only mode, compression/dedupe enablement, the suspend gate). Everything
//! mutable in it is either atomic or owned by exactly one zone; `Shared` itself is never
//! locked.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use crossbeam::channel::unbounded;
use futures::channel::oneshot;
use futures::executor::block_on;
use slog::Logger;

use crate::block::{buf_from, is_zero, Lbn, Pbn, BLOCK_SIZE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::journal::LockCounter;
use crate::request::{Ack, BatchCompletion, ReadAck, Request};
use crate::storage::Storage;
use crate::zone::{
    ack, cpu, hash, journal, logical, packer, physical, AckMsg, CpuMsg, HashMsg, JournalMsg,
    LogicalMsg, PackerMsg, PhysicalMsg, Router, ZoneId,
};

/// The monotonic statistics counters, updated by the zones as they work.
#[derive(Default)]
pub struct StatCounters {
    /// Host operations accepted.
    pub host_reads: AtomicU64,
    /// Host writes accepted.
    pub host_writes: AtomicU64,
    /// Host trims accepted (per block after splitting).
    pub host_trims: AtomicU64,
    /// Host flushes accepted.
    pub host_flushes: AtomicU64,
    /// Data blocks read from storage.
    pub data_reads: AtomicU64,
    /// Data blocks written to storage (uncompressed and packed).
    pub data_writes: AtomicU64,
    /// Logical blocks currently mapped (including zero mappings).
    pub logical_used: AtomicU64,
    /// Physical data blocks currently holding at least one reference or lease.
    pub allocated: AtomicU64,
    /// Advice oracle queries.
    pub dedupe_queries: AtomicU64,
    /// Writes that ended up sharing an existing block.
    pub dedupe_hits: AtomicU64,
    /// Packed blocks written.
    pub packed_blocks: AtomicU64,
    /// Compressed fragments living in packed blocks.
    pub packed_fragments: AtomicU64,
    /// Bins cancelled for want of a second member.
    pub packer_cancels: AtomicU64,
    /// Journal entries appended.
    pub journal_entries: AtomicU64,
    /// Journal block commits (a block recommits as it fills).
    pub journal_commits: AtomicU64,
}

/// A point-in-time statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// The logical size in blocks.
    pub logical_blocks: u64,
    /// The physical size in blocks.
    pub physical_blocks: u64,
    /// Physical blocks reserved for metadata (the journal region).
    pub overhead: u64,
    /// Logical blocks currently mapped.
    pub logical_blocks_used: u64,
    /// Physical data blocks currently allocated.
    pub physical_blocks_allocated: u64,
    /// Physical data blocks currently free.
    pub physical_blocks_free: u64,
    /// Host operations accepted.
    pub host_reads: u64,
    /// Host writes accepted.
    pub host_writes: u64,
    /// Host trims accepted.
    pub host_trims: u64,
    /// Host flushes accepted.
    pub host_flushes: u64,
    /// Data blocks read from storage.
    pub data_reads: u64,
    /// Data blocks written to storage.
    pub data_writes: u64,
    /// Advice oracle queries.
    pub dedupe_queries: u64,
    /// Writes that deduplicated.
    pub dedupe_hits: u64,
    /// Packed blocks written.
    pub packed_blocks: u64,
    /// Compressed fragments written into packed blocks.
    pub packed_fragments: u64,
    /// Bins cancelled for want of members.
    pub packer_cancels: u64,
    /// Journal entries appended.
    pub journal_entries: u64,
    /// Journal block commits.
    pub journal_commits: u64,
    /// Whether the device is in read-only mode.
    pub read_only: bool,
}

/// The in-flight gate: counts outstanding host operations and outstanding internal work
/// (scheduled decrements), and lets the admin path wait for both to drain.
pub struct Gate {
    /// `(host operations, internal operations)`.
    state: Mutex<(usize, usize)>,
    /// Signalled whenever both counts reach zero.
    idle: Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate { state: Mutex::new((0, 0)), idle: Condvar::new() }
    }

    /// A host operation entered the device.
    pub fn op_started(&self) {
        self.state.lock().unwrap().0 += 1;
    }

    /// A host operation completed.
    pub fn op_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 -= 1;
        if state.0 == 0 && state.1 == 0 {
            self.idle.notify_all();
        }
    }

    /// Internal work (a scheduled decrement) was issued.
    pub fn internal_started(&self) {
        self.state.lock().unwrap().1 += 1;
    }

    /// Internal work completed.
    pub fn internal_finished(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 -= 1;
        if state.0 == 0 && state.1 == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until nothing is in flight.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.0 > 0 || state.1 > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }
}

/// State visible to every zone.
pub struct Shared {
    /// The construction-time configuration. The growable dimensions are shadowed by the
    /// atomics below and must not be read from here after construction.
    pub config: Config,
    /// The current logical size in blocks.
    pub logical_blocks: AtomicU64,
    /// The current physical size in blocks.
    pub physical_blocks: AtomicU64,
    /// The first data PBN.
    pub data_start: Pbn,
    /// The backing store.
    pub storage: Arc<dyn Storage>,
    /// The zone senders.
    pub router: Router,
    /// The root logger.
    pub log: Logger,
    /// The statistics counters.
    pub stats: StatCounters,
    /// Set once metadata fails; never cleared.
    pub read_only: AtomicBool,
    /// Refuses new host operations while suspended.
    pub suspended: AtomicBool,
    /// Whether new writes may enter the compression path.
    pub compression_enabled: AtomicBool,
    /// Whether new writes may consult the advice oracle.
    pub dedupe_enabled: AtomicBool,
    /// The journal lock counter.
    pub lock_counter: LockCounter,
    /// The in-flight gate.
    pub gate: Gate,
    /// Round-robin cursor over physical zones for allocation.
    pub next_alloc_zone: AtomicUsize,
    /// The request id counter.
    pub next_id: AtomicU64,
    /// The data range `(start, end)` owned by each physical zone. Only `grow_physical`
    /// writes this after construction.
    pub physical_ranges: RwLock<Vec<(Pbn, Pbn)>>,
}

impl Shared {
    /// The physical zone owning a data PBN.
    pub fn zone_of_pbn(&self, pbn: Pbn) -> ZoneId {
        let ranges = self.physical_ranges.read().unwrap();
        ranges
            .iter()
            .position(|&(start, end)| pbn >= start && pbn < end)
            .expect("data PBN outside every physical zone")
    }

    /// Move the device into read-only mode because of a metadata failure.
    pub fn enter_read_only(&self, cause: &Error) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            crit!(self.log, "metadata failure, device is now read-only"; "cause" => %cause);
        }
    }

    /// Is the device in read-only mode?
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Take the next request id.
    pub fn take_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// The administrative state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminState {
    /// Serving I/O.
    Normal,
    /// Quiesced; only admin operations proceed.
    Suspended,
}

/// The admin-side bookkeeping, serialized by one mutex.
struct Admin {
    /// The current administrative state.
    state: AdminState,
    /// The logical dimension a grow was prepared for.
    prepared_logical: Option<u64>,
    /// The physical dimension a grow was prepared for.
    prepared_physical: Option<u64>,
}

/// A deduplicating, compressing virtual block device.
pub struct Device {
    /// State shared with the zones.
    shared: Arc<Shared>,
    /// Every zone thread, joined on drop.
    threads: Vec<thread::JoinHandle<()>>,
    /// The admin bookkeeping; `try_lock` failure is [`Error::ComponentBusy`].
    admin: Mutex<Admin>,
}

impl Device {
    /// Construct a device over `storage` and start its fabric.
    pub fn new(config: Config, storage: Arc<dyn Storage>, log: Logger) -> Result<Device> {
        config.validate()?;
        if storage.blocks() < config.physical_blocks {
            return Err(Error::OutOfRange {
                block: config.physical_blocks,
                limit: storage.blocks(),
            });
        }

        info!(log, "starting device";
              "logical blocks" => config.logical_blocks,
              "physical blocks" => config.physical_blocks,
              "logical zones" => config.logical_zones,
              "physical zones" => config.physical_zones,
              "hash zones" => config.hash_zones);

        // Create every channel up front so the router is complete before any thread runs.
        let (logical_txs, logical_rxs): (Vec<_>, Vec<_>) =
            (0..config.logical_zones).map(|_| unbounded()).unzip();
        let (physical_txs, physical_rxs): (Vec<_>, Vec<_>) =
            (0..config.physical_zones).map(|_| unbounded()).unzip();
        let (hash_txs, hash_rxs): (Vec<_>, Vec<_>) =
            (0..config.hash_zones).map(|_| unbounded()).unzip();
        let (cpu_tx, cpu_rx) = unbounded();
        let (packer_tx, packer_rx) = unbounded();
        let (journal_tx, journal_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();

        let router = Router {
            logical: logical_txs,
            physical: physical_txs,
            hash: hash_txs,
            cpu: cpu_tx,
            packer: packer_tx,
            journal: journal_tx,
            ack: ack_tx,
        };

        // Carve the data region into one contiguous slab per physical zone; the remainder
        // lands in the last zone.
        let data_start = config.data_start();
        let per_zone = config.data_blocks() / config.physical_zones as u64;
        let ranges: Vec<(Pbn, Pbn)> = (0..config.physical_zones)
            .map(|zone| {
                let start = data_start + zone as u64 * per_zone;
                let end = if zone + 1 == config.physical_zones {
                    config.physical_blocks
                } else {
                    start + per_zone
                };
                (start, end)
            })
            .collect();

        // The journal ring: PBN 0 is the null sentinel, so the ring occupies the rest of the
        // metadata region.
        let ring = (config.journal_blocks - 1) as usize;

        let shared = Arc::new(Shared {
            logical_blocks: AtomicU64::new(config.logical_blocks),
            physical_blocks: AtomicU64::new(config.physical_blocks),
            data_start,
            storage,
            router,
            log: log.clone(),
            stats: StatCounters::default(),
            read_only: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            compression_enabled: AtomicBool::new(config.compression),
            dedupe_enabled: AtomicBool::new(config.dedupe),
            lock_counter: LockCounter::new(ring, config.logical_zones, config.physical_zones),
            gate: Gate::new(),
            next_alloc_zone: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            physical_ranges: RwLock::new(ranges.clone()),
            config,
        });

        let mut threads = Vec::new();
        for (zone, rx) in logical_rxs.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || logical::run(zone, shared, rx)));
        }
        for (zone, rx) in physical_rxs.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let range = ranges[zone];
            threads.push(thread::spawn(move || physical::run(zone, range, shared, rx)));
        }
        for (zone, rx) in hash_rxs.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || hash::run(zone, shared, rx)));
        }
        for worker in 0..shared.config.cpu_workers {
            let shared = Arc::clone(&shared);
            let rx = cpu_rx.clone();
            threads.push(thread::spawn(move || cpu::run(worker, shared, rx)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || packer::run(shared, packer_rx)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || journal::run(shared, journal_rx)));
        }
        {
            let shared = Arc::clone(&shared);
            threads.push(thread::spawn(move || ack::run(shared, ack_rx)));
        }

        Ok(Device {
            shared,
            threads,
            admin: Mutex::new(Admin {
                state: AdminState::Normal,
                prepared_logical: None,
                prepared_physical: None,
            }),
        })
    }

    /// Check that host I/O may enter, and that `lbn` is on the device.
    fn admit(&self, lbn: Lbn) -> Result<()> {
        if self.shared.suspended.load(Ordering::Acquire) {
            return Err(Error::InvalidAdminState { operation: "I/O while suspended" });
        }
        let limit = self.shared.logical_blocks.load(Ordering::Acquire);
        if lbn >= limit {
            return Err(Error::OutOfRange { block: lbn, limit });
        }
        Ok(())
    }

    /// Write one block.
    pub fn write(&self, lbn: Lbn, payload: &[u8]) -> Ack {
        self.submit_write(lbn, payload, false)
    }

    /// Write one block with force-unit-access semantics: the journal is flushed before the
    /// acknowledgement, and the payload is never compressed.
    pub fn write_fua(&self, lbn: Lbn, payload: &[u8]) -> Ack {
        self.submit_write(lbn, payload, true)
    }

    fn submit_write(&self, lbn: Lbn, payload: &[u8], fua: bool) -> Ack {
        if let Err(err) = self.admit(lbn) {
            return Ack::failed(err);
        }
        if payload.len() != BLOCK_SIZE {
            return Ack::failed(Error::Io(format!(
                "payload is {} bytes, expected {}",
                payload.len(),
                BLOCK_SIZE
            )));
        }
        if self.shared.is_read_only() {
            return Ack::failed(Error::ReadOnly);
        }

        self.shared.stats.host_writes.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let mut request = Request::write(
            self.shared.take_id(),
            lbn,
            buf_from(payload),
            is_zero(payload),
            fua,
            sender,
        );
        request.zones.logical = fingerprint::logical_zone(lbn, self.shared.config.logical_zones);

        self.shared.gate.op_started();
        let zone = request.zones.logical;
        self.shared.router.to_logical(zone, LogicalMsg::Launch(request));
        Ack::new(receiver)
    }

    /// Read one block.
    pub fn read(&self, lbn: Lbn) -> ReadAck {
        if let Err(err) = self.admit(lbn) {
            return ReadAck::failed(err);
        }

        self.shared.stats.host_reads.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let mut request = Request::read(self.shared.take_id(), lbn, sender);
        request.zones.logical = fingerprint::logical_zone(lbn, self.shared.config.logical_zones);

        self.shared.gate.op_started();
        let zone = request.zones.logical;
        self.shared.router.to_logical(zone, LogicalMsg::Read(request));
        ReadAck::new(receiver)
    }

    /// Trim `count` blocks starting at `lbn`.
    ///
    /// The range is split into per-block requests; the acknowledgement resolves when the last
    /// of them is journaled, with the first error if any failed.
    pub fn trim(&self, lbn: Lbn, count: u64) -> Ack {
        if let Err(err) = self.admit(lbn) {
            return Ack::failed(err);
        }
        let limit = self.shared.logical_blocks.load(Ordering::Acquire);
        if count == 0 || count > limit || lbn > limit - count {
            return Ack::failed(Error::OutOfRange { block: lbn.saturating_add(count), limit });
        }
        if self.shared.is_read_only() {
            return Ack::failed(Error::ReadOnly);
        }

        let (sender, receiver) = oneshot::channel();
        let batch = BatchCompletion::new(count as usize, sender);
        for block in lbn..lbn + count {
            self.shared.stats.host_trims.fetch_add(1, Ordering::Relaxed);
            let mut request =
                Request::trim(self.shared.take_id(), block, Arc::clone(&batch));
            request.zones.logical =
                fingerprint::logical_zone(block, self.shared.config.logical_zones);

            self.shared.gate.op_started();
            let zone = request.zones.logical;
            self.shared.router.to_logical(zone, LogicalMsg::Launch(request));
        }
        Ack::new(receiver)
    }

    /// Flush: acknowledge once every journal entry issued before this call is durable.
    pub fn flush(&self) -> Ack {
        if self.shared.suspended.load(Ordering::Acquire) {
            return Ack::failed(Error::InvalidAdminState { operation: "flush while suspended" });
        }
        self.shared.stats.host_flushes.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.shared.router.to_journal(JournalMsg::Flush { done: sender });
        Ack::new(receiver)
    }

    /// Flush every open packer bin.
    ///
    /// Exposed for tests and hosts that want latency bounds tighter than the bin age.
    pub fn flush_packer(&self) {
        let (sender, receiver) = oneshot::channel();
        self.shared.router.to_packer(PackerMsg::FlushAll { done: Some(sender) });
        let _ = block_on(receiver);
    }

    /// Wait until nothing is in flight, including scheduled decrements.
    ///
    /// Parked compressed fragments are flushed out of the packer first, since they would
    /// otherwise stay in flight until their bin ages out.
    pub fn quiesce(&self) {
        self.flush_packer();
        self.shared.gate.wait_idle();
    }

    /// Suspend the device: quiesce every component and stop admitting host I/O.
    ///
    /// `save` commits all metadata; since this core journals synchronously, both flavors end
    /// with the same journal flush.
    pub fn suspend(&self, save: bool) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        if admin.state == AdminState::Suspended {
            return Err(Error::InvalidAdminState { operation: "suspend while suspended" });
        }

        info!(self.shared.log, "suspending device"; "save" => save);
        // Quiesce in dependency order: stop intake, drain the packer, drain requests, then
        // make the journal durable.
        self.shared.suspended.store(true, Ordering::Release);
        self.flush_packer();
        self.shared.gate.wait_idle();

        let (sender, receiver) = oneshot::channel();
        self.shared.router.to_journal(JournalMsg::Flush { done: sender });
        let flushed =
            block_on(receiver).unwrap_or_else(|_| Err(Error::Io("journal stopped".into())));
        if let Err(err) = flushed {
            // The suspend did not complete; reopen the intake so the caller can decide.
            self.shared.suspended.store(false, Ordering::Release);
            return Err(err);
        }

        admin.state = AdminState::Suspended;
        Ok(())
    }

    /// Resume a suspended device.
    pub fn resume(&self) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        if admin.state != AdminState::Suspended {
            return Err(Error::InvalidAdminState { operation: "resume while running" });
        }
        info!(self.shared.log, "resuming device");
        self.shared.suspended.store(false, Ordering::Release);
        admin.state = AdminState::Normal;
        Ok(())
    }

    /// Prepare to grow the logical space to `new_blocks`.
    pub fn prepare_to_grow_logical(&self, new_blocks: u64) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        let current = self.shared.logical_blocks.load(Ordering::Acquire);
        if new_blocks <= current {
            return Err(Error::OutOfRange { block: new_blocks, limit: current });
        }
        admin.prepared_logical = Some(new_blocks);
        Ok(())
    }

    /// Grow the logical space to the prepared size.
    pub fn grow_logical(&self, new_blocks: u64) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        if admin.state != AdminState::Suspended {
            return Err(Error::InvalidAdminState { operation: "grow while running" });
        }
        match admin.prepared_logical.take() {
            None => Err(Error::InvalidAdminState { operation: "grow without prepare" }),
            Some(prepared) if prepared != new_blocks => {
                // Put the preparation back; the caller may retry with the right size.
                admin.prepared_logical = Some(prepared);
                Err(Error::ParameterMismatch { prepared, applied: new_blocks })
            }
            Some(_) => {
                info!(self.shared.log, "growing logical space"; "blocks" => new_blocks);
                self.shared.logical_blocks.store(new_blocks, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Prepare to grow the physical space to `new_blocks`.
    pub fn prepare_to_grow_physical(&self, new_blocks: u64) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        let current = self.shared.physical_blocks.load(Ordering::Acquire);
        if new_blocks <= current {
            return Err(Error::OutOfRange { block: new_blocks, limit: current });
        }
        admin.prepared_physical = Some(new_blocks);
        Ok(())
    }

    /// Grow the physical space to the prepared size.
    ///
    /// The new blocks extend the last physical zone's slab.
    pub fn grow_physical(&self, new_blocks: u64) -> Result<()> {
        let mut admin = self.admin.try_lock().map_err(|_| Error::ComponentBusy)?;
        if admin.state != AdminState::Suspended {
            return Err(Error::InvalidAdminState { operation: "grow while running" });
        }
        match admin.prepared_physical.take() {
            None => Err(Error::InvalidAdminState { operation: "grow without prepare" }),
            Some(prepared) if prepared != new_blocks => {
                admin.prepared_physical = Some(prepared);
                Err(Error::ParameterMismatch { prepared, applied: new_blocks })
            }
            Some(_) => {
                info!(self.shared.log, "growing physical space"; "blocks" => new_blocks);
                self.shared.storage.grow(new_blocks)?;

                let last = self.shared.config.physical_zones - 1;
                self.shared.physical_ranges.write().unwrap()[last].1 = new_blocks;
                self.shared.physical_blocks.store(new_blocks, Ordering::Release);

                let (sender, receiver) = oneshot::channel();
                self.shared.router.to_physical(
                    last,
                    PhysicalMsg::Grow { new_end: new_blocks, done: sender },
                );
                block_on(receiver).map_err(|_| Error::Io("physical zone stopped".into()))?;
                Ok(())
            }
        }
    }

    /// Enable or disable compression for future writes.
    pub fn set_compression(&self, enabled: bool) {
        info!(self.shared.log, "compression switched"; "enabled" => enabled);
        self.shared.compression_enabled.store(enabled, Ordering::Release);
    }

    /// Enable or disable deduplication for future writes.
    pub fn set_dedupe(&self, enabled: bool) {
        info!(self.shared.log, "dedupe switched"; "enabled" => enabled);
        self.shared.dedupe_enabled.store(enabled, Ordering::Release);
    }

    /// A statistics snapshot.
    pub fn stats(&self) -> Stats {
        let stats = &self.shared.stats;
        let physical = self.shared.physical_blocks.load(Ordering::Acquire);
        let overhead = self.shared.data_start;
        let allocated = stats.allocated.load(Ordering::Acquire);
        Stats {
            logical_blocks: self.shared.logical_blocks.load(Ordering::Acquire),
            physical_blocks: physical,
            overhead,
            logical_blocks_used: stats.logical_used.load(Ordering::Acquire),
            physical_blocks_allocated: allocated,
            physical_blocks_free: physical - overhead - allocated,
            host_reads: stats.host_reads.load(Ordering::Acquire),
            host_writes: stats.host_writes.load(Ordering::Acquire),
            host_trims: stats.host_trims.load(Ordering::Acquire),
            host_flushes: stats.host_flushes.load(Ordering::Acquire),
            data_reads: stats.data_reads.load(Ordering::Acquire),
            data_writes: stats.data_writes.load(Ordering::Acquire),
            dedupe_queries: stats.dedupe_queries.load(Ordering::Acquire),
            dedupe_hits: stats.dedupe_hits.load(Ordering::Acquire),
            packed_blocks: stats.packed_blocks.load(Ordering::Acquire),
            packed_fragments: stats.packed_fragments.load(Ordering::Acquire),
            packer_cancels: stats.packer_cancels.load(Ordering::Acquire),
            journal_entries: stats.journal_entries.load(Ordering::Acquire),
            journal_commits: stats.journal_commits.load(Ordering::Acquire),
            read_only: self.shared.is_read_only(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(self.shared.log, "shutting down the fabric");
        for tx in &self.shared.router.logical {
            let _ = tx.send(LogicalMsg::Shutdown);
        }
        for tx in &self.shared.router.physical {
            let _ = tx.send(PhysicalMsg::Shutdown);
        }
        for tx in &self.shared.router.hash {
            let _ = tx.send(HashMsg::Shutdown);
        }
        for _ in 0..self.shared.config.cpu_workers {
            let _ = self.shared.router.cpu.send(CpuMsg::Shutdown);
        }
        let _ = self.shared.router.packer.send(PackerMsg::Shutdown);
        let _ = self.shared.router.journal.send(JournalMsg::Shutdown);
        let _ = self.shared.router.ack.send(AckMsg::Shutdown);

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
