//! Physical zones: slabs, reference counts, and data I/O.
//!
//! A physical zone owns one contiguous slab of the data region: its reference counts, its
//! free blocks, and every read and write against them. Reference-count mutations are
//! serialized by the zone thread, and the decrement path participates in the journal's lock
//! counter so the journal head can never advance over an entry whose decrement has not been
//! applied.
//!
//! # Leases
//!
//! A lease is simply a counted reference that does not come from the block map. An
//! allocation holds one from the moment the block is granted until the owning request
//! acknowledges (or aborts), and a hash lock holds one on the block its members dedupe
//! against from verification (or the agent's write) until its last member leaves. Because
//! every journaled increment happens before its request acknowledges, and the lease outlives
//! the acknowledgement, a block's count can never touch zero while an increment for it is
//! still in flight, and a block is reused only when it is genuinely unreferenced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use slog::Logger;

use crate::block::{Pbn, BLOCK_SIZE};
use crate::codec;
use crate::compression::Stage;
use crate::device::Shared;
use crate::error::Error;
use crate::journal::JournalPoint;
use crate::request::Request;
use crate::zone::{
    AckMsg, HashMsg, JournalMsg, PhysicalMsg, ReleaseThen, WriteThen, ZoneId,
};

/// The largest reference count.
///
/// A count that reaches the cap freezes there: further increments and decrements are ignored,
/// so the block can never be freed. Freezing leaks at worst one block per pathological
/// fingerprint; letting the count wrap would free live data.
const MAX_REFS: u8 = 254;

/// The state of one physical zone.
struct PhysicalZone {
    /// This zone's index.
    id: ZoneId,
    /// The first PBN of this zone's slab.
    start: Pbn,
    /// One past the last PBN of this zone's slab.
    end: Pbn,
    /// Device-wide state.
    shared: Arc<Shared>,
    /// Reference counts, indexed by `pbn - start`.
    refs: Vec<u8>,
    /// Blocks freed by decrements, reused before the scan cursor moves.
    free: Vec<Pbn>,
    /// The first never-allocated offset.
    cursor: u64,
    /// This zone's logger.
    log: Logger,
}

/// The physical zone thread.
pub fn run(id: ZoneId, range: (Pbn, Pbn), shared: Arc<Shared>, rx: Receiver<PhysicalMsg>) {
    let log = shared.log.new(o!("zone" => format!("physical-{}", id)));
    let mut zone = PhysicalZone {
        id,
        start: range.0,
        end: range.1,
        shared,
        refs: vec![0; (range.1 - range.0) as usize],
        free: Vec::new(),
        cursor: 0,
        log,
    };
    while let Ok(msg) = rx.recv() {
        match msg {
            PhysicalMsg::Allocate(request) => zone.allocate(request),
            PhysicalMsg::Release { request, then } => zone.release(request, then),
            PhysicalMsg::Verify(request) => zone.verify(request),
            PhysicalMsg::WriteData { request, then } => zone.write_data(request, then),
            PhysicalMsg::WritePacked { pbn, block, members } => {
                zone.write_packed(pbn, block, members)
            }
            PhysicalMsg::RefInc(request) => zone.ref_inc(request),
            PhysicalMsg::RefDec { pbn, point } => zone.ref_dec(pbn, point),
            PhysicalMsg::AcquireLease { pbn } => zone.add_ref(pbn),
            PhysicalMsg::ReleaseLease { pbn } => {
                // Lease releases are gate-registered by their senders so a quiesce cannot
                // observe counts with a release still in flight.
                zone.drop_ref(pbn);
                zone.shared.gate.internal_finished();
            }
            PhysicalMsg::ReadData(request) => zone.read_data(request),
            PhysicalMsg::Grow { new_end, done } => {
                zone.grow(new_end);
                let _ = done.send(());
            }
            PhysicalMsg::Shutdown => break,
        }
    }
}

impl PhysicalZone {
    /// The count slot of a PBN this zone owns.
    fn slot(&self, pbn: Pbn) -> usize {
        debug_assert!(pbn >= self.start && pbn < self.end, "PBN outside this zone's slab");
        (pbn - self.start) as usize
    }

    /// Open a provisional lease on a free block.
    fn acquire_provisional(&mut self) -> Option<Pbn> {
        let pbn = self.free.pop().or_else(|| {
            while self.cursor < self.end - self.start {
                let candidate = self.start + self.cursor;
                self.cursor += 1;
                if self.refs[self.slot(candidate)] == 0 {
                    return Some(candidate);
                }
            }
            None
        })?;
        let slot = self.slot(pbn);
        debug_assert_eq!(self.refs[slot], 0, "allocating a referenced block");
        // The allocation's write lease is the block's first reference.
        self.refs[slot] = 1;
        self.shared.stats.allocated.fetch_add(1, Ordering::Relaxed);
        Some(pbn)
    }

    /// Add one reference to a live block.
    fn add_ref(&mut self, pbn: Pbn) {
        let slot = self.slot(pbn);
        debug_assert!(self.refs[slot] >= 1, "counting a reference on a free block");
        if self.refs[slot] >= MAX_REFS {
            warn!(self.log, "reference count saturated"; "pbn" => pbn);
            return;
        }
        self.refs[slot] += 1;
    }

    /// Drop one reference from a block, freeing it on zero.
    fn drop_ref(&mut self, pbn: Pbn) {
        let slot = self.slot(pbn);
        debug_assert!(self.refs[slot] >= 1, "dropping a reference on a free block");
        if self.refs[slot] >= MAX_REFS {
            // Frozen; see MAX_REFS.
            return;
        }
        self.refs[slot] -= 1;
        if self.refs[slot] == 0 {
            self.free.push(pbn);
            self.shared.stats.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Stage 2: reserve a provisional block for a write.
    fn allocate(&mut self, mut request: Box<Request>) {
        match self.acquire_provisional() {
            Some(pbn) => {
                trace!(self.log, "leased a provisional block";
                       "pbn" => pbn, "lbn" => request.lbn);
                request.allocation = Some(pbn);
                request.zones.allocated = Some(self.id);
            }
            None => {
                request.alloc_attempts += 1;
                if request.alloc_attempts < self.shared.config.physical_zones {
                    // This slab is full; try the next zone before giving up.
                    let next = (self.id + 1) % self.shared.config.physical_zones;
                    self.shared.router.to_physical(next, PhysicalMsg::Allocate(request));
                    return;
                }
                // Every slab is full. The write continues without an allocation:
                // deduplication may still absorb it, but it can never be compressed, since
                // packing requires a block of its own to fall back to.
                debug!(self.log, "allocation failed, continuing for dedupe";
                       "lbn" => request.lbn);
                request.compression.set_done();
            }
        }
        // Stage 3: on to fingerprinting.
        self.shared.router.to_cpu(crate::zone::CpuMsg::Hash(request));
    }

    /// Release a request's write lease and route it onward.
    fn release(&mut self, mut request: Box<Request>, then: ReleaseThen) {
        let pbn = request.allocation.take().expect("releasing without an allocation");
        self.drop_ref(pbn);
        trace!(self.log, "released a write lease"; "pbn" => pbn);

        match then {
            ReleaseThen::Journal => self.shared.router.to_journal(JournalMsg::Append(request)),
            ReleaseThen::Ack => self.shared.router.to_ack(AckMsg::Complete(request)),
            ReleaseThen::HashLock => {
                let zone = request.zones.hash.expect("hash-lock release without a hash zone");
                self.shared.router.to_hash(zone, HashMsg::WriteDone(request));
            }
        }
    }

    /// Stage 6: verify a dedupe candidate by reading and comparing it.
    ///
    /// On a match the hash lock gains a read lease on the candidate. On any kind of
    /// mismatch, including stale or unstable candidates, the request falls through to its
    /// own write; bad advice is never an error.
    fn verify(&mut self, mut request: Box<Request>) {
        let pbn = request.duplicate.expect("verify without a candidate");
        let slot = self.slot(pbn);

        let matched = match self.refs[slot] {
            // Freed since the advice was posted.
            0 => false,
            // Saturated: another reference could not be counted anyway.
            refs if refs >= MAX_REFS => false,
            _ => {
                let mut buf = vec![0; BLOCK_SIZE];
                self.shared.stats.data_reads.fetch_add(1, Ordering::Relaxed);
                match self.shared.storage.read_block(pbn, &mut buf) {
                    Ok(()) => buf[..] == request.data.as_ref().expect("verify without data")[..],
                    Err(err) => {
                        // A failed candidate read only costs the dedupe opportunity.
                        warn!(self.log, "dedupe candidate unreadable";
                              "pbn" => pbn, "error" => %err);
                        false
                    }
                }
            }
        };

        if matched {
            // The hash lock now holds a read lease: the candidate cannot be freed while
            // members dedupe against it.
            self.add_ref(pbn);
            request.is_duplicate = true;
        }
        trace!(self.log, "verified dedupe candidate"; "pbn" => pbn, "matched" => matched);

        let zone = request.zones.hash.expect("verify without a hash zone");
        self.shared.router.to_hash(zone, HashMsg::VerifyDone(request));
    }

    /// Write a request's payload, uncompressed, to its allocated block.
    fn write_data(&mut self, mut request: Box<Request>, then: WriteThen) {
        let pbn = match request.allocation {
            Some(pbn) => pbn,
            None => {
                // The last resort needed a block and there is none.
                request.fail(Error::NoSpace);
                self.shared.router.to_ack(AckMsg::Complete(request));
                return;
            }
        };
        debug_assert!(pbn >= self.start && pbn < self.end);

        let result = self
            .shared
            .storage
            .write_block(pbn, request.data.as_ref().expect("data write without data"));
        match result {
            Ok(()) => {
                self.shared.stats.data_writes.fetch_add(1, Ordering::Relaxed);
                request.new_mapping = crate::block::Mapping::uncompressed(pbn);
            }
            Err(err) => {
                debug!(self.log, "data write failed"; "pbn" => pbn, "error" => %err);
                request.fail(err);
            }
        }

        match then {
            // Agents report to their hash lock even on failure, so the lock can release its
            // waiters instead of stranding them.
            WriteThen::HashLock => {
                let zone = request.zones.hash.expect("agent write without a hash zone");
                self.shared.router.to_hash(zone, HashMsg::WriteDone(request));
            }
            WriteThen::Journal => {
                if request.error.is_some() {
                    // Independent writer: unwind the lease here, since nobody else will.
                    self.drop_ref(pbn);
                    request.allocation = None;
                    self.shared.router.to_ack(AckMsg::Complete(request));
                } else {
                    self.shared.router.to_journal(JournalMsg::Append(request));
                }
            }
        }
    }

    /// Write an assembled packed block through the agent's allocation.
    ///
    /// On success every member maps to its fragment of the shared block: non-agent members
    /// release their own allocations on the way to their hash locks. On failure every member
    /// unwinds through its hash lock, which will bypass its waiters.
    fn write_packed(&mut self, pbn: Pbn, block: Vec<u8>, members: Vec<Box<Request>>) {
        debug_assert!(pbn >= self.start && pbn < self.end);
        let result = self.shared.storage.write_block(pbn, &block);

        match result {
            Ok(()) => {
                self.shared.stats.data_writes.fetch_add(1, Ordering::Relaxed);
                self.shared.stats.packed_blocks.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .stats
                    .packed_fragments
                    .fetch_add(members.len() as u64, Ordering::Relaxed);
                debug!(self.log, "wrote a packed block";
                       "pbn" => pbn, "fragments" => members.len());

                for mut member in members {
                    let _stage = member.compression.advance();
                    debug_assert_eq!(_stage, Stage::PostPacker);
                    member.new_mapping = crate::block::Mapping::compressed(pbn, member.slot);

                    let hash_zone =
                        member.zones.hash.expect("packed member without a hash zone");
                    if member.allocation == Some(pbn) {
                        // The agent keeps its lease on the now-shared block until it
                        // acknowledges.
                        self.shared.router.to_hash(hash_zone, HashMsg::WriteDone(member));
                    } else {
                        // Other members reference the agent's block; their own leases are no
                        // longer needed.
                        let zone = member
                            .zones
                            .allocated
                            .expect("packed member without an allocation zone");
                        self.shared.router.to_physical(
                            zone,
                            PhysicalMsg::Release { request: member, then: ReleaseThen::HashLock },
                        );
                    }
                }
            }
            Err(err) => {
                debug!(self.log, "packed write failed"; "pbn" => pbn, "error" => %err);
                for mut member in members {
                    member.compression.advance();
                    member.fail(err.clone());
                    let hash_zone =
                        member.zones.hash.expect("packed member without a hash zone");
                    self.shared.router.to_hash(hash_zone, HashMsg::WriteDone(member));
                }
            }
        }
    }

    /// Stage 10b: count the journaled reference to the request's new mapping.
    ///
    /// The block is provably live here: either the request's own write lease or its hash
    /// lock's lease is still held, so the count is at least one.
    fn ref_inc(&mut self, request: Box<Request>) {
        self.add_ref(request.new_mapping.pbn);
        self.shared.router.to_ack(AckMsg::Complete(request));
    }

    /// Stage 12: apply the decrement scheduled when `point` was journaled.
    fn ref_dec(&mut self, pbn: Pbn, point: JournalPoint) {
        self.shared.lock_counter.physical_increment(point.sequence, self.id);
        self.drop_ref(pbn);
        self.shared.lock_counter.physical_decrement(point.sequence, self.id);
        self.shared
            .router
            .to_journal(JournalMsg::EntryClosed { sequence: point.sequence });
        self.shared.gate.internal_finished();
    }

    /// Fetch the block a read resolved to.
    fn read_data(&mut self, mut request: Box<Request>) {
        let mapping = request.new_mapping;
        let mut buf = vec![0; BLOCK_SIZE];
        self.shared.stats.data_reads.fetch_add(1, Ordering::Relaxed);
        let result = self.shared.storage.read_block(mapping.pbn, &mut buf).and_then(|()| {
            match mapping.state {
                crate::block::MappingState::Uncompressed => {
                    Ok(buf.into_boxed_slice())
                }
                crate::block::MappingState::Compressed(fragment_slot) => {
                    let fragment = codec::packed_fragment(&buf, fragment_slot)?;
                    Ok(codec::decompress(fragment)?.into_boxed_slice())
                }
                _ => unreachable!("fetching a storage-less mapping"),
            }
        });
        match result {
            Ok(data) => request.data = Some(data),
            Err(err) => request.fail(err),
        }
        self.shared.router.to_ack(AckMsg::Complete(request));
    }

    /// Extend this zone's slab to end at `new_end`.
    fn grow(&mut self, new_end: Pbn) {
        debug_assert!(new_end >= self.end);
        info!(self.log, "growing slab"; "old end" => self.end, "new end" => new_end);
        self.refs.resize((new_end - self.start) as usize, 0);
        self.end = new_end;
    }
}
