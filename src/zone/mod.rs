//! The thread/zone fabric.
//!
//! Every resource class is sharded into zones, and every zone is owned by exactly one OS
//! thread: the zone's state is moved into the thread's closure at spawn, so the type system
//! itself enforces that only the owning thread touches it. "Continue on zone Z with callback
//! C" is expressed as a value: each zone consumes a message enum naming the stages it can run,
//! and advancing a request to another zone means sending it there. The core's correctness
//! rests on the ordering of these messages, not on indirection.
//!
//! Channels are unbounded: backpressure on the data path is exercised through the request
//! pool's admission (the host submits a bounded number of bios) and the journal ring, never by
//! blocking a zone thread on a full channel, which could deadlock two zones sending to each
//! other.

pub mod ack;
pub mod cpu;
pub mod hash;
pub mod journal;
pub mod logical;
pub mod packer;
pub mod physical;

use crossbeam::channel::Sender;
use futures::channel::oneshot;

use crate::block::{Lbn, Pbn};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::journal::JournalPoint;
use crate::request::Request;

/// A zone index within its resource class.
pub type ZoneId = usize;

/// Where a request goes after its allocation is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseThen {
    /// On to the journal: the request found another home for its data (dedupe, zero block).
    Journal,
    /// On to acknowledgement: the request is aborting.
    Ack,
    /// On to the request's hash lock as a finished write: a packed member whose fragment now
    /// lives in the agent's block.
    HashLock,
}

/// Where a request goes after its uncompressed data write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteThen {
    /// Notify the request's hash lock: the request is the lock's agent and waiters may now
    /// dedupe against it.
    HashLock,
    /// Straight to the journal: the request writes independently (its lock is bypassing).
    Journal,
}

/// Messages a logical zone consumes.
pub enum LogicalMsg {
    /// Stage 1: acquire the LBN lock and read the old mapping.
    Launch(Box<Request>),
    /// A read: look up the mapping and forward to the physical zone.
    Read(Box<Request>),
    /// Stage 10: the journal entry is durable; install the new mapping.
    MapUpdate(Box<Request>),
    /// Release the LBN lock of `lbn`, waking the next queued writer.
    ReleaseLock { lbn: Lbn },
    /// Stop the zone thread.
    Shutdown,
}

/// Messages a physical zone consumes.
pub enum PhysicalMsg {
    /// Stage 2: reserve a provisional PBN for the request.
    Allocate(Box<Request>),
    /// Release the request's provisional allocation, then route it onward.
    Release { request: Box<Request>, then: ReleaseThen },
    /// Stage 6: read the dedupe candidate in `request.duplicate`, compare, and take a read
    /// lease on match.
    Verify(Box<Request>),
    /// Write the request's payload, uncompressed, to its allocation.
    WriteData { request: Box<Request>, then: WriteThen },
    /// Write an assembled packed block to the agent's allocation and move every member on.
    WritePacked { pbn: Pbn, block: Vec<u8>, members: Vec<Box<Request>> },
    /// Stage 10b: count the new mapping's reference.
    RefInc(Box<Request>),
    /// Stage 12: apply the decrement scheduled when `point` was journaled.
    RefDec { pbn: Pbn, point: JournalPoint },
    /// Take a hash lock's lease on `pbn` (one extra reference).
    AcquireLease { pbn: Pbn },
    /// Drop a lease on `pbn` (a hash lock's, or a request's spent write lease).
    ReleaseLease { pbn: Pbn },
    /// Fetch the block a read resolved to.
    ReadData(Box<Request>),
    /// Extend this zone's slab to end at `new_end` (exclusive).
    Grow { new_end: Pbn, done: oneshot::Sender<()> },
    /// Stop the zone thread.
    Shutdown,
}

/// Messages a hash zone consumes.
pub enum HashMsg {
    /// Stage 4: join (or create) the hash lock for the request's fingerprint.
    Acquire(Box<Request>),
    /// Stage 6 result: verification finished; `request.is_duplicate` says how.
    VerifyDone(Box<Request>),
    /// The agent's own data write finished (compressed or not); waiters may dedupe.
    WriteDone(Box<Request>),
    /// A member finished; drop it from the lock of `fingerprint`.
    Release { fingerprint: Fingerprint },
    /// Stop the zone thread.
    Shutdown,
}

/// Messages the packer zone consumes.
pub enum PackerMsg {
    /// Stage 8: bin the request's compressed fragment.
    Admit(Box<Request>),
    /// Dislodge a cancelled request from its bin.
    Remove { id: u64 },
    /// Flush every open bin, then signal `done`.
    FlushAll { done: Option<oneshot::Sender<()>> },
    /// Stop the zone thread.
    Shutdown,
}

/// Messages the journal zone consumes.
pub enum JournalMsg {
    /// Stage 9: append and commit the request's mapping change.
    Append(Box<Request>),
    /// An entry of block `sequence` has had all its reference-count effects applied.
    EntryClosed { sequence: u64 },
    /// Commit everything appended so far and flush the store.
    Flush { done: oneshot::Sender<Result<()>> },
    /// Commit and flush on behalf of a FUA write, then forward it to acknowledgement.
    FuaFlush(Box<Request>),
    /// Stop the zone thread.
    Shutdown,
}

/// Messages the CPU workers consume.
pub enum CpuMsg {
    /// Stage 3: fingerprint the payload (or detect the zero block).
    Hash(Box<Request>),
    /// Stage 7: compress the payload.
    Compress(Box<Request>),
    /// Stop one worker.
    Shutdown,
}

/// Messages the acknowledgement zone consumes.
pub enum AckMsg {
    /// Stage 11: complete the host future and unwind locks.
    Complete(Box<Request>),
    /// Stop the zone thread.
    Shutdown,
}

/// The senders of every zone: how zones continue a request on another zone.
///
/// Sends ignore disconnection: a missing receiver means the device is shutting down, and the
/// request's completion channel reports that to the host on drop.
pub struct Router {
    /// One sender per logical zone.
    pub logical: Vec<Sender<LogicalMsg>>,
    /// One sender per physical zone.
    pub physical: Vec<Sender<PhysicalMsg>>,
    /// One sender per hash zone.
    pub hash: Vec<Sender<HashMsg>>,
    /// The shared CPU worker queue.
    pub cpu: Sender<CpuMsg>,
    /// The packer zone.
    pub packer: Sender<PackerMsg>,
    /// The journal zone.
    pub journal: Sender<JournalMsg>,
    /// The acknowledgement zone.
    pub ack: Sender<AckMsg>,
}

impl Router {
    /// Continue on logical zone `zone`.
    pub fn to_logical(&self, zone: ZoneId, msg: LogicalMsg) {
        let _ = self.logical[zone].send(msg);
    }

    /// Continue on physical zone `zone`.
    pub fn to_physical(&self, zone: ZoneId, msg: PhysicalMsg) {
        let _ = self.physical[zone].send(msg);
    }

    /// Continue on hash zone `zone`.
    pub fn to_hash(&self, zone: ZoneId, msg: HashMsg) {
        let _ = self.hash[zone].send(msg);
    }

    /// Continue on a CPU worker.
    pub fn to_cpu(&self, msg: CpuMsg) {
        let _ = self.cpu.send(msg);
    }

    /// Continue on the packer.
    pub fn to_packer(&self, msg: PackerMsg) {
        let _ = self.packer.send(msg);
    }

    /// Continue on the journal.
    pub fn to_journal(&self, msg: JournalMsg) {
        let _ = self.journal.send(msg);
    }

    /// Continue on the acknowledgement zone.
    pub fn to_ack(&self, msg: AckMsg) {
        let _ = self.ack.send(msg);
    }
}
