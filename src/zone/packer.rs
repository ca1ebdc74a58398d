//! The packer: binning compressed fragments into shared blocks.
//!
//! The packer runs single-threaded and its bins are pure zone-owned state. Admission is
//! best-fit: a new fragment goes to the fullest bin that still has room, maximizing the
//! chance that bins fill completely. A bin flushes when its slots are full or when it has
//! been open longer than the configured age, whichever comes first. The age check rides on
//! the channel receive timeout, so an idle packer still makes progress.
//!
//! A flush picks the first remaining member as the *agent*: the packed block is written
//! through the agent's allocation, every other member releases its own allocation and maps to
//! a fragment slot of the agent's block. A bin that cannot muster two members is cancelled
//! instead, since a packed block with one fragment would be strictly worse than the
//! uncompressed block it replaces.
//!
//! Members parked here can be cancelled from other zones (a newer write mooting an older
//! one). The canceller that wins the `Packing`-stage cancel sends a removal; dropping a bin
//! below two members cancels the whole bin, which closes the race where a mooted fragment
//! would be written into a shared block it has no business occupying.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::codec;
use crate::compression::Stage;
use crate::device::Shared;
use crate::request::Request;
use crate::zone::{PackerMsg, PhysicalMsg, WriteThen};

/// One open bin of compressed fragments.
struct Bin {
    /// The member requests, in admission order.
    members: Vec<Box<Request>>,
    /// Payload bytes used so far.
    used: usize,
    /// When the bin was opened, for the age deadline.
    opened: Instant,
}

impl Bin {
    fn new() -> Bin {
        Bin { members: Vec::new(), used: 0, opened: Instant::now() }
    }
}

/// The packer state.
struct Packer {
    /// Device-wide state.
    shared: Arc<Shared>,
    /// The open bins.
    bins: Vec<Bin>,
    /// The packer's logger.
    log: slog::Logger,
}

/// The packer zone thread.
pub fn run(shared: Arc<Shared>, rx: Receiver<PackerMsg>) {
    let log = shared.log.new(o!("zone" => "packer"));
    let tick = (shared.config.packer_bin_age / 2).max(Duration::from_millis(1));
    let mut packer = Packer { shared, bins: Vec::new(), log };

    loop {
        match rx.recv_timeout(tick) {
            Ok(PackerMsg::Admit(request)) => packer.admit(request),
            Ok(PackerMsg::Remove { id }) => packer.remove(id),
            Ok(PackerMsg::FlushAll { done }) => {
                packer.flush_all();
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Ok(PackerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => packer.flush_aged(),
        }
    }
}

impl Packer {
    /// Stage 8: place a fragment in a bin.
    fn admit(&mut self, request: Box<Request>) {
        if request.compression.may_not_compress() {
            // Mooted on the way in. The removal message may have raced ahead of this
            // admission and found nothing; don't park a fragment nobody will dislodge.
            request.compression.advance();
            self.write_uncompressed(request);
            return;
        }
        let size = request.compressed.as_ref().expect("packing without a fragment").len();
        let slots = self.shared.config.slots_per_bin;
        let capacity = codec::payload_capacity();
        debug_assert!(size <= capacity);

        // Best fit: the fullest bin that still has room.
        let mut best: Option<usize> = None;
        for (index, bin) in self.bins.iter().enumerate() {
            if bin.members.len() < slots && bin.used + size <= capacity {
                if best.map_or(true, |current| self.bins[current].used < bin.used) {
                    best = Some(index);
                }
            }
        }
        let index = best.unwrap_or_else(|| {
            self.bins.push(Bin::new());
            self.bins.len() - 1
        });

        let bin = &mut self.bins[index];
        bin.used += size;
        bin.members.push(request);
        trace!(self.log, "admitted fragment";
               "bin" => index, "bytes" => size, "members" => bin.members.len());

        if bin.members.len() == slots {
            self.flush_bin(index);
        }
    }

    /// Dislodge a cancelled member.
    ///
    /// The id may be gone already (the bin may have flushed or aged out between the cancel
    /// and this message), in which case there is nothing left to do.
    fn remove(&mut self, id: u64) {
        let position = self.bins.iter().enumerate().find_map(|(bin_index, bin)| {
            bin.members
                .iter()
                .position(|member| member.id == id)
                .map(|member_index| (bin_index, member_index))
        });
        let (bin_index, member_index) = match position {
            Some(position) => position,
            None => return,
        };

        let request = {
            let bin = &mut self.bins[bin_index];
            let request = bin.members.remove(member_index);
            bin.used -= request.compressed.as_ref().map_or(0, Vec::len);
            request
        };
        trace!(self.log, "dislodged mooted fragment"; "id" => id);
        // The veto is already set; the advance lands in PostPacker.
        request.compression.advance();
        self.write_uncompressed(request);

        if self.bins[bin_index].members.len() < 2 {
            // The cancellation starved the bin; cancel it entirely rather than letting a
            // lone fragment wait for companions that may never come.
            self.flush_bin(bin_index);
        }
    }

    /// Flush one bin: emit a packed block, or cancel if not worthwhile.
    fn flush_bin(&mut self, index: usize) {
        let bin = self.bins.swap_remove(index);
        if bin.members.is_empty() {
            return;
        }

        // Packing → Writing for everyone still willing; vetoed members drop out here and
        // are rewritten uncompressed.
        let mut writers = Vec::new();
        for request in bin.members {
            match request.compression.advance() {
                Stage::Writing => writers.push(request),
                _ => self.write_uncompressed(request),
            }
        }

        if writers.len() < 2 {
            // A shared block needs at least two sharers.
            if !writers.is_empty() {
                self.shared.stats.packer_cancels.fetch_add(1, Ordering::Relaxed);
            }
            for request in writers {
                request.compression.set_done();
                self.write_uncompressed(request);
            }
            return;
        }

        // The first remaining member is the agent; the packed block is written through its
        // allocation.
        for (slot, request) in writers.iter_mut().enumerate() {
            request.slot = slot as u8;
        }
        let fragments: Vec<&[u8]> = writers
            .iter()
            .map(|request| request.compressed.as_ref().unwrap().as_slice())
            .collect();
        let block = codec::encode_packed(&fragments);

        let pbn = writers[0].allocation.expect("packed agent without an allocation");
        debug!(self.log, "flushing bin"; "pbn" => pbn, "fragments" => writers.len());
        let zone = self.shared.zone_of_pbn(pbn);
        self.shared
            .router
            .to_physical(zone, PhysicalMsg::WritePacked { pbn, block, members: writers });
    }

    /// Flush bins that have exceeded the age deadline.
    fn flush_aged(&mut self) {
        let age = self.shared.config.packer_bin_age;
        while let Some(index) = self.bins.iter().position(|bin| bin.opened.elapsed() >= age) {
            self.flush_bin(index);
        }
    }

    /// Flush every bin (suspend, explicit flush, shutdown).
    fn flush_all(&mut self) {
        while !self.bins.is_empty() {
            self.flush_bin(0);
        }
    }

    /// Send a member back to the uncompressed path on its own allocation.
    fn write_uncompressed(&self, request: Box<Request>) {
        let zone = request.zones.allocated.expect("packer member without an allocation");
        self.shared
            .router
            .to_physical(zone, PhysicalMsg::WriteData { request, then: WriteThen::HashLock });
    }
}
