//! Hash zones: the per-fingerprint locking protocol.
//!
//! A hash lock serializes every dedupe decision for one fingerprint, so that at most one
//! request ever verifies against or writes a given candidate block. The first arrival becomes
//! the *agent* and does the work; later arrivals wait, and when the agent's outcome is known
//! they share it without redoing it.
//!
//! The lock walks `Initializing → Querying`, then either `Deduping → Verifying → Updating`
//! (the oracle's advice checked out; everyone shares the advised block), or `Locking →
//! Writing → Unlocking` (no advice, or stale advice; the agent writes its own copy, possibly
//! compressed, and waiters then dedupe against that), or `Bypassing` (the agent failed;
//! waiters each write independently). A lock holds at most one read lease at a time and
//! releases it when the last member leaves.
//!
//! Members of one lock share a block on the strength of the fingerprint alone: at 128
//! cryptographic bits, a collision is not a practical concern. Byte-for-byte verification is
//! reserved for oracle advice, which unlike lock membership can be stale (the advised block
//! may have been overwritten since the advice was posted).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use slog::Logger;

use crate::block::Mapping;
use crate::compression::Stage;
use crate::device::Shared;
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::index::{AdviceOracle, AdviceTable};
use crate::request::{Op, Request};
use crate::zone::{
    AckMsg, CpuMsg, HashMsg, JournalMsg, PhysicalMsg, ReleaseThen, WriteThen, ZoneId,
};

/// The phase of a hash lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    /// The agent is verifying an advised candidate.
    Verifying,
    /// Verification succeeded; members share the advised block.
    Updating,
    /// The agent is writing its own copy (compressing and packing included).
    Writing,
    /// The agent's copy is on disk; members share it.
    Unlocking,
    /// The agent failed; members write their own copies.
    Bypassing,
}

/// The coordination site of one fingerprint.
struct HashLock {
    /// The lock's phase.
    state: LockState,
    /// The id of the agent request.
    agent: u64,
    /// How many requests are members (the agent included).
    members: usize,
    /// Requests parked until the agent's outcome is known.
    waiters: VecDeque<Box<Request>>,
    /// What members dedupe against, once known.
    duplicate: Option<Mapping>,
    /// The read lease this lock holds, if any.
    lease: Option<u64>,
}

/// The state of one hash zone.
struct HashZone {
    /// This zone's index.
    id: ZoneId,
    /// Device-wide state.
    shared: Arc<Shared>,
    /// The live locks of this zone's fingerprint partition.
    locks: HashMap<Fingerprint, HashLock>,
    /// This zone's shard of the advice oracle.
    oracle: AdviceTable,
    /// This zone's logger.
    log: Logger,
}

/// The hash zone thread.
pub fn run(id: ZoneId, shared: Arc<Shared>, rx: Receiver<HashMsg>) {
    let log = shared.log.new(o!("zone" => format!("hash-{}", id)));
    let mut zone =
        HashZone { id, shared, locks: HashMap::new(), oracle: AdviceTable::new(), log };
    while let Ok(msg) = rx.recv() {
        match msg {
            HashMsg::Acquire(request) => zone.acquire(request),
            HashMsg::VerifyDone(request) => zone.verify_done(request),
            HashMsg::WriteDone(request) => zone.write_done(request),
            HashMsg::Release { fingerprint } => zone.release(fingerprint),
            HashMsg::Shutdown => break,
        }
    }
}

/// What a late joiner should do, decided while the lock is borrowed.
enum JoinAction {
    /// Parked; nothing more to do now.
    Parked,
    /// Share the known duplicate.
    Dedupe(Box<Request>, Mapping),
    /// Write an independent copy.
    Bypass(Box<Request>),
}

impl HashZone {
    /// Stage 4: join or create the lock for the request's fingerprint.
    fn acquire(&mut self, mut request: Box<Request>) {
        let fingerprint = request.fingerprint.expect("hash lock entry without a fingerprint");
        debug_assert_eq!(fingerprint.zone(self.shared.config.hash_zones), self.id);
        request.in_hash_lock = true;

        if let Some(lock) = self.locks.get_mut(&fingerprint) {
            lock.members += 1;
            let action = match lock.state {
                LockState::Updating | LockState::Unlocking => JoinAction::Dedupe(
                    request,
                    lock.duplicate.expect("sharing state without a duplicate"),
                ),
                LockState::Bypassing => JoinAction::Bypass(request),
                LockState::Verifying | LockState::Writing => {
                    trace!(self.log, "waiting in hash lock"; "agent" => lock.agent);
                    lock.waiters.push_back(request);
                    JoinAction::Parked
                }
            };
            match action {
                JoinAction::Parked => {}
                JoinAction::Dedupe(request, duplicate) => self.dedupe_member(request, duplicate),
                JoinAction::Bypass(request) => self.write_independently(request),
            }
            return;
        }

        // First member for this fingerprint: become the agent and query the oracle
        // (Initializing → Querying).
        let mut lock = HashLock {
            state: LockState::Writing,
            agent: request.id,
            members: 1,
            waiters: VecDeque::new(),
            duplicate: None,
            lease: None,
        };

        let advice = if self.shared.dedupe_enabled.load(Ordering::Acquire) {
            self.shared.stats.dedupe_queries.fetch_add(1, Ordering::Relaxed);
            self.oracle.query(fingerprint)
        } else {
            None
        };
        // Advice is only usable if it points into the data region and is not the agent's own
        // provisional block.
        let physical_blocks = self.shared.physical_blocks.load(Ordering::Acquire);
        let advice = advice
            .filter(|&pbn| pbn >= self.shared.data_start && pbn < physical_blocks)
            .filter(|&pbn| request.allocation != Some(pbn));

        match advice {
            Some(pbn) => {
                // Querying → Deduping → Verifying: take the candidate to its physical zone
                // for the byte-compare.
                trace!(self.log, "oracle advice"; "pbn" => pbn);
                lock.state = LockState::Verifying;
                self.locks.insert(fingerprint, lock);
                request.duplicate = Some(pbn);
                request.zones.duplicate = Some(self.shared.zone_of_pbn(pbn));
                let zone = request.zones.duplicate.unwrap();
                self.shared.router.to_physical(zone, PhysicalMsg::Verify(request));
            }
            None => {
                // Querying → Locking → Writing: no advice; the agent writes its own copy.
                self.locks.insert(fingerprint, lock);
                self.enter_write_path(request);
            }
        }
    }

    /// Stage 6 outcome: the candidate matched or it did not.
    fn verify_done(&mut self, request: Box<Request>) {
        let fingerprint = request.fingerprint.expect("verify outcome without a fingerprint");
        let mut lock = self.locks.remove(&fingerprint).expect("verify outcome without a lock");

        if request.is_duplicate {
            // Verifying → Updating: everyone shares the verified block, on which the
            // physical zone just granted this lock a read lease.
            let pbn = request.duplicate.expect("verified without a candidate");
            let duplicate = Mapping::uncompressed(pbn);
            lock.state = LockState::Updating;
            lock.duplicate = Some(duplicate);
            lock.lease = Some(pbn);
            self.oracle.post(fingerprint, pbn);

            let waiters: Vec<_> = lock.waiters.drain(..).collect();
            self.locks.insert(fingerprint, lock);

            self.dedupe_member(request, duplicate);
            for waiter in waiters {
                self.dedupe_member(waiter, duplicate);
            }
        } else {
            // Verifying → Locking: the advice was stale; the agent proceeds to write.
            debug!(self.log, "stale dedupe advice"; "pbn" => request.duplicate.unwrap_or(0));
            lock.state = LockState::Writing;
            self.locks.insert(fingerprint, lock);
            self.enter_write_path(request);
        }
    }

    /// Locking → Writing: send the agent into the compression pipeline, or straight to an
    /// uncompressed write if it is not eligible.
    fn enter_write_path(&mut self, mut request: Box<Request>) {
        if request.allocation.is_none() {
            // No allocation and no duplicate: this is where NoSpace becomes fatal.
            request.fail(Error::NoSpace);
            self.write_done(request);
            return;
        }

        let eligible = self.shared.compression_enabled.load(Ordering::Acquire)
            && !request.fua
            && request.op == Op::Write;
        if eligible {
            // NotStarted → Compressing, unless a moot already vetoed it.
            if request.compression.advance() == Stage::Compressing {
                self.shared.router.to_cpu(CpuMsg::Compress(request));
                return;
            }
        } else {
            request.compression.set_done();
        }

        let zone = request.zones.allocated.expect("write path without an allocation zone");
        self.shared
            .router
            .to_physical(zone, PhysicalMsg::WriteData { request, then: WriteThen::HashLock });
    }

    /// The agent's own write finished, well or badly.
    fn write_done(&mut self, request: Box<Request>) {
        let fingerprint = request.fingerprint.expect("write outcome without a fingerprint");
        let mut lock = self.locks.remove(&fingerprint).expect("write outcome without a lock");
        debug_assert_eq!(lock.agent, request.id);

        if request.error.is_some() {
            // Writing → Bypassing: the waiters each write their own copies rather than
            // deduping against a block that never materialized.
            lock.state = LockState::Bypassing;
            let waiters: Vec<_> = lock.waiters.drain(..).collect();
            self.locks.insert(fingerprint, lock);

            for waiter in waiters {
                self.write_independently(waiter);
            }
            self.abort_member(request);
        } else {
            // Writing → Unlocking: waiters now dedupe against the agent's block. The lock
            // takes its own lease on that block so it stays live until the last member is
            // done counting references to it.
            let duplicate = request.new_mapping;
            lock.state = LockState::Unlocking;
            lock.duplicate = Some(duplicate);
            lock.lease = Some(duplicate.pbn);
            let zone = self.shared.zone_of_pbn(duplicate.pbn);
            self.shared
                .router
                .to_physical(zone, PhysicalMsg::AcquireLease { pbn: duplicate.pbn });

            if duplicate.state == crate::block::MappingState::Uncompressed {
                // Only whole-block homes make useful advice; a fragment cannot be verified
                // byte-for-byte by a future stranger.
                self.oracle.post(fingerprint, duplicate.pbn);
            }
            let waiters: Vec<_> = lock.waiters.drain(..).collect();
            self.locks.insert(fingerprint, lock);

            for waiter in waiters {
                self.dedupe_member(waiter, duplicate);
            }
            self.shared.router.to_journal(JournalMsg::Append(request));
        }
    }

    /// Point a member at the shared block and send it on to the journal.
    fn dedupe_member(&mut self, mut request: Box<Request>, duplicate: Mapping) {
        request.is_duplicate = true;
        request.new_mapping = duplicate;
        request.compression.set_done();
        self.shared.stats.dedupe_hits.fetch_add(1, Ordering::Relaxed);

        match request.zones.allocated {
            Some(zone) if request.allocation.is_some() => {
                // The member's own provisional block is no longer needed.
                self.shared.router.to_physical(
                    zone,
                    PhysicalMsg::Release { request, then: ReleaseThen::Journal },
                );
            }
            _ => self.shared.router.to_journal(JournalMsg::Append(request)),
        }
    }

    /// Send a member to write its own copy, without dedupe (the lock is bypassing).
    fn write_independently(&mut self, mut request: Box<Request>) {
        request.compression.set_done();
        match request.allocation {
            None => {
                request.fail(Error::NoSpace);
                self.shared.router.to_ack(AckMsg::Complete(request));
            }
            Some(_) => {
                let zone = request.zones.allocated.expect("allocation without a zone");
                self.shared.router.to_physical(
                    zone,
                    PhysicalMsg::WriteData { request, then: WriteThen::Journal },
                );
            }
        }
    }

    /// Unwind a failed agent.
    fn abort_member(&mut self, request: Box<Request>) {
        match request.zones.allocated {
            Some(zone) if request.allocation.is_some() => {
                self.shared.router.to_physical(
                    zone,
                    PhysicalMsg::Release { request, then: ReleaseThen::Ack },
                );
            }
            _ => self.shared.router.to_ack(AckMsg::Complete(request)),
        }
    }

    /// A member finished; drop it from its lock, recycling the lock when it empties.
    ///
    /// The caller registered this hop with the gate; any lease release is registered in turn
    /// before this hop retires, so the chain stays visible to quiesce end to end.
    fn release(&mut self, fingerprint: Fingerprint) {
        let empty = {
            let lock = self.locks.get_mut(&fingerprint).expect("releasing an absent hash lock");
            lock.members -= 1;
            lock.members == 0
        };
        if empty {
            let lock = self.locks.remove(&fingerprint).unwrap();
            debug_assert!(lock.waiters.is_empty(), "waiters outlived the members");
            if let Some(pbn) = lock.lease {
                self.shared.gate.internal_started();
                let zone = self.shared.zone_of_pbn(pbn);
                self.shared.router.to_physical(zone, PhysicalMsg::ReleaseLease { pbn });
            }
        }
        self.shared.gate.internal_finished();
    }
}
