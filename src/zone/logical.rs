//! Logical zones: LBN locks and the block map.
//!
//! A logical zone owns a partition of the logical address space, selected by LBN hash. Within
//! the zone everything is serialized by the thread itself, which gives the two ordering
//! guarantees the journal relies on: at most one request holds the lock of a given LBN at a
//! time, and journal entries for one LBN are appended in the order the writes arrived.
//!
//! The LBN lock is a FIFO queue per block-map slot, held from launch until the block-map
//! update. A writer queueing behind a holder *moots* the holder's compression: the newer data
//! is going to supersede the older anyway, so there is no reason to let the older version sit
//! in a packer bin waiting for companions. If the cancel wins responsibility (the holder was
//! in the packing stage), the queued writer's zone dislodges the holder from the packer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use slog::Logger;

use crate::block::{zero_buf, Lbn, Mapping, MappingState};
use crate::compression::CompressionStatus;
use crate::device::Shared;
use crate::error::Error;
use crate::request::{Op, Request};
use crate::zone::{AckMsg, JournalMsg, LogicalMsg, PackerMsg, PhysicalMsg, ZoneId};

/// The FIFO lock of one logical block.
struct LbnLock {
    /// The id of the request holding the lock.
    holder: u64,
    /// The holder's compression word, kept so queued writers can moot it.
    holder_compression: Arc<CompressionStatus>,
    /// Writers waiting for the lock, in arrival order.
    waiters: VecDeque<Box<Request>>,
}

/// The state of one logical zone.
struct LogicalZone {
    /// This zone's index.
    id: ZoneId,
    /// Device-wide state.
    shared: Arc<Shared>,
    /// The block map partition: absent means unmapped.
    map: HashMap<Lbn, Mapping>,
    /// The live LBN locks.
    locks: HashMap<Lbn, LbnLock>,
    /// This zone's logger.
    log: Logger,
}

/// The logical zone thread.
pub fn run(id: ZoneId, shared: Arc<Shared>, rx: Receiver<LogicalMsg>) {
    let log = shared.log.new(o!("zone" => format!("logical-{}", id)));
    let mut zone = LogicalZone { id, shared, map: HashMap::new(), locks: HashMap::new(), log };
    while let Ok(msg) = rx.recv() {
        match msg {
            LogicalMsg::Launch(request) => zone.launch(request),
            LogicalMsg::Read(request) => zone.read(request),
            LogicalMsg::MapUpdate(request) => zone.map_update(request),
            LogicalMsg::ReleaseLock { lbn } => zone.release_lock(lbn),
            LogicalMsg::Shutdown => break,
        }
    }
}

impl LogicalZone {
    /// Stage 1: acquire the LBN lock, or queue for it.
    fn launch(&mut self, mut request: Box<Request>) {
        debug_assert_eq!(request.zones.logical, self.id);

        if self.shared.is_read_only() && request.op != Op::Read {
            request.fail(Error::ReadOnly);
            self.shared.router.to_ack(AckMsg::Complete(request));
            return;
        }

        if let Some(lock) = self.locks.get_mut(&request.lbn) {
            trace!(self.log, "queueing on the LBN lock";
                   "lbn" => request.lbn, "holder" => lock.holder);
            // Moot the holder's compression; its data is about to be superseded.
            if lock.holder_compression.cancel() {
                // The holder sits in a packer bin and we won the responsibility of
                // dislodging it.
                self.shared.router.to_packer(PackerMsg::Remove { id: lock.holder });
            }
            lock.waiters.push_back(request);
            return;
        }

        self.locks.insert(
            request.lbn,
            LbnLock {
                holder: request.id,
                holder_compression: Arc::clone(&request.compression),
                waiters: VecDeque::new(),
            },
        );
        request.holds_lbn_lock = true;
        self.proceed(request);
    }

    /// Continue a request that has just been granted its LBN lock.
    fn proceed(&mut self, mut request: Box<Request>) {
        // Read the old mapping under the lock; it cannot change until this request updates
        // it.
        request.old_mapping = self.map.get(&request.lbn).copied().unwrap_or_default();

        match request.op {
            Op::Trim => {
                // Trims skip allocation, hashing, compression, and packing.
                request.new_mapping = Mapping::unmapped();
                self.shared.router.to_journal(JournalMsg::Append(request));
            }
            Op::Write if request.is_zero => {
                // Zero blocks occupy no storage and skip the whole dedupe pipeline; the
                // tombstone mapping is journaled like any other change.
                request.new_mapping = Mapping::zero();
                self.shared.router.to_journal(JournalMsg::Append(request));
            }
            Op::Write => {
                // Stage 2: ask a physical zone for a provisional block, round-robin so the
                // slabs fill evenly.
                let zones = self.shared.config.physical_zones;
                let zone =
                    self.shared.next_alloc_zone.fetch_add(1, Ordering::Relaxed) % zones;
                self.shared.router.to_physical(zone, PhysicalMsg::Allocate(request));
            }
            Op::Read => unreachable!("reads do not take LBN locks"),
        }
    }

    /// Serve a read: consult the map and fetch from the owning physical zone.
    fn read(&mut self, mut request: Box<Request>) {
        let mapping = self.map.get(&request.lbn).copied().unwrap_or_default();
        if mapping.reads_as_zero() {
            request.data = Some(zero_buf());
            self.shared.router.to_ack(AckMsg::Complete(request));
            return;
        }
        request.new_mapping = mapping;
        let zone = self.shared.zone_of_pbn(mapping.pbn);
        self.shared.router.to_physical(zone, PhysicalMsg::ReadData(request));
    }

    /// Stage 10: the journal entry is durable; install the new mapping.
    fn map_update(&mut self, request: Box<Request>) {
        let point = request.journal_point.expect("map update without a journal entry");
        self.shared.lock_counter.logical_increment(point.sequence, self.id);

        let old = self.map.get(&request.lbn).copied().unwrap_or_default();
        debug_assert_eq!(old, request.old_mapping, "mapping changed under an LBN lock");

        trace!(self.log, "installing mapping";
               "lbn" => request.lbn, "new" => %request.new_mapping);
        if request.new_mapping.state == MappingState::Unmapped {
            self.map.remove(&request.lbn);
        } else {
            self.map.insert(request.lbn, request.new_mapping);
        }

        let was_used = old.state != MappingState::Unmapped;
        let now_used = request.new_mapping.state != MappingState::Unmapped;
        if !was_used && now_used {
            self.shared.stats.logical_used.fetch_add(1, Ordering::Relaxed);
        } else if was_used && !now_used {
            self.shared.stats.logical_used.fetch_sub(1, Ordering::Relaxed);
        }

        self.shared.lock_counter.logical_decrement(point.sequence, self.id);

        // Stage 10b: count the new reference on its physical zone, then acknowledge. The old
        // mapping's decrement is scheduled after the acknowledgement.
        if request.new_mapping.is_counted() {
            let zone = self.shared.zone_of_pbn(request.new_mapping.pbn);
            self.shared.router.to_physical(zone, PhysicalMsg::RefInc(request));
        } else {
            self.shared.router.to_ack(AckMsg::Complete(request));
        }
    }

    /// Release the lock of `lbn` and grant it to the next queued writer.
    fn release_lock(&mut self, lbn: Lbn) {
        let mut lock = self.locks.remove(&lbn).expect("releasing an LBN lock nobody holds");
        if let Some(mut next) = lock.waiters.pop_front() {
            lock.holder = next.id;
            lock.holder_compression = Arc::clone(&next.compression);
            if !lock.waiters.is_empty() {
                // A still-newer write is already queued; the new holder is mooted before it
                // even starts, so keep it out of the compression path.
                lock.holder_compression.cancel();
            }
            self.locks.insert(lbn, lock);

            next.holds_lbn_lock = true;
            if self.shared.is_read_only() && next.op != Op::Read {
                // The device went read-only while this writer queued; drain it.
                next.fail(Error::ReadOnly);
                self.shared.router.to_ack(AckMsg::Complete(next));
            } else {
                self.proceed(next);
            }
        }
    }
}
