//! The journal zone: appending, committing, and head advancement.
//!
//! The journal thread owns the tail of the recovery journal. Mapping changes arrive as
//! requests, get an entry in the open block, and are parked until the block is committed to
//! the metadata region; only then do they continue to the block-map update, which is what
//! makes "acknowledged" imply "journaled". Appends that arrive together commit together: the
//! thread drains its channel before writing, so a burst of writes costs one block write, not
//! one per request.
//!
//! The head advances over a block only when the lock counter says every entry's effects are
//! durable. Appends that would lap the head park in an overflow queue and resume as the head
//! moves.
//!
//! A failed journal write is a metadata failure: the device goes read-only and every parked
//! request drains with an error.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use slog::Logger;

use crate::block::Pbn;
use crate::device::Shared;
use crate::error::{Error, Result};
use crate::journal::{encode_block, JournalEntry, JournalPoint};
use crate::request::Request;
use crate::zone::{AckMsg, JournalMsg, LogicalMsg, PhysicalMsg, ReleaseThen};

/// The state of the journal zone.
struct JournalZone {
    /// Device-wide state.
    shared: Arc<Shared>,
    /// The ring size in blocks.
    ring: u64,
    /// The oldest still-locked block sequence.
    head: u64,
    /// The open block's sequence.
    tail: u64,
    /// The open block's entries.
    open: Vec<JournalEntry>,
    /// Requests whose entries are appended but not yet committed.
    pending: Vec<Box<Request>>,
    /// Requests waiting for ring space.
    overflow: VecDeque<Box<Request>>,
    /// The journal's logger.
    log: Logger,
}

/// The journal zone thread.
pub fn run(shared: Arc<Shared>, rx: Receiver<JournalMsg>) {
    let log = shared.log.new(o!("zone" => "journal"));
    let ring = shared.config.journal_blocks - 1;
    let mut zone = JournalZone {
        shared,
        ring,
        head: 0,
        tail: 0,
        open: Vec::new(),
        pending: Vec::new(),
        overflow: VecDeque::new(),
        log,
    };

    // Process in batches: block for one message, drain whatever else is ready, then commit
    // once for the whole burst.
    'outer: while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while let Ok(msg) = rx.try_recv() {
            batch.push(msg);
        }
        for msg in batch {
            match msg {
                JournalMsg::Append(request) => zone.append(request),
                JournalMsg::EntryClosed { sequence } => zone.entry_closed(sequence),
                JournalMsg::Flush { done } => {
                    let _ = done.send(zone.flush());
                }
                JournalMsg::FuaFlush(request) => zone.fua_flush(request),
                JournalMsg::Shutdown => break 'outer,
            }
        }
        zone.commit();
    }
}

impl JournalZone {
    /// The PBN a block sequence lands on: the ring lives behind the null sentinel.
    fn block_pbn(&self, sequence: u64) -> Pbn {
        1 + sequence % self.ring
    }

    /// Stage 9: reserve an entry for the request's mapping change.
    fn append(&mut self, mut request: Box<Request>) {
        if self.shared.is_read_only() {
            request.fail(Error::ReadOnly);
            self.drain(request);
            return;
        }
        if self.tail - self.head >= self.ring || !self.overflow.is_empty() {
            // The tail would lap the head, or earlier appends are already parked; park
            // behind them until decrements release old blocks.
            debug!(self.log, "journal ring full"; "head" => self.head, "tail" => self.tail);
            self.overflow.push_back(request);
            return;
        }
        self.append_entry(request);
    }

    /// Reserve the entry proper. The caller has checked ring space.
    fn append_entry(&mut self, mut request: Box<Request>) {
        let point = JournalPoint { sequence: self.tail, entry: self.open.len() };
        request.journal_point = Some(point);
        self.shared.lock_counter.journal_increment(point.sequence);
        self.shared.stats.journal_entries.fetch_add(1, Ordering::Relaxed);
        self.open.push(JournalEntry {
            lbn: request.lbn,
            old: request.old_mapping,
            new: request.new_mapping,
        });
        self.pending.push(request);

        if self.open.len() == self.shared.config.journal_entries_per_block {
            // Seal the block; its final form is written with the batch commit.
            if self.write_open() {
                self.tail += 1;
                self.open.clear();
            }
        }
    }

    /// Write the open block to its ring slot. Returns `false` on metadata failure.
    fn write_open(&mut self) -> bool {
        let buf = encode_block(self.tail, &self.open);
        match self.shared.storage.write_block(self.block_pbn(self.tail), &buf) {
            Ok(()) => {
                self.shared.stats.journal_commits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.shared.enter_read_only(&err);
                false
            }
        }
    }

    /// Commit the batch: make every appended entry durable and release its request to the
    /// block-map update.
    fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let committed = (self.open.is_empty() || self.write_open())
            && match self.shared.storage.flush() {
                Ok(()) => true,
                Err(err) => {
                    self.shared.enter_read_only(&err);
                    false
                }
            };

        let pending: Vec<_> = self.pending.drain(..).collect();
        for mut request in pending {
            if committed {
                let zone = request.zones.logical;
                self.shared.router.to_logical(zone, LogicalMsg::MapUpdate(request));
            } else {
                // The entry never became durable; the mapping must not be installed. The
                // journal lock opened at append is released on the spot.
                let point = request.journal_point.take().expect("pending without a point");
                self.release_entry(point.sequence);
                request.fail(Error::ReadOnly);
                drain_request(&self.shared, request);
            }
        }
    }

    /// Force the journal durable (host flush, suspend, FUA).
    fn flush(&mut self) -> Result<()> {
        if self.shared.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if !self.open.is_empty() && !self.write_open() {
            return Err(Error::ReadOnly);
        }
        match self.shared.storage.flush() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.enter_read_only(&err);
                Err(Error::ReadOnly)
            }
        }
    }

    /// FUA tail: flush, then send the write on to acknowledgement.
    fn fua_flush(&mut self, mut request: Box<Request>) {
        if let Err(err) = self.flush() {
            request.fail(err);
        }
        self.shared.router.to_ack(AckMsg::Complete(request));
    }

    /// An entry's reference-count effects are fully applied.
    fn entry_closed(&mut self, sequence: u64) {
        if self.shared.lock_counter.journal_decrement(sequence) {
            // The block may now be unlocked; advance the head as far as it goes.
            let mut advanced = false;
            while self.head < self.tail && self.shared.lock_counter.is_unlocked(self.head) {
                self.head += 1;
                advanced = true;
            }
            if advanced {
                trace!(self.log, "advanced journal head"; "head" => self.head);
                // Freed ring space; resume parked appends in arrival order.
                while !self.overflow.is_empty() && self.tail - self.head < self.ring {
                    let mut request = self.overflow.pop_front().unwrap();
                    if self.shared.is_read_only() {
                        request.fail(Error::ReadOnly);
                        self.drain(request);
                    } else {
                        self.append_entry(request);
                    }
                }
            }
        }
    }

    /// Release the journal lock of an entry that never committed.
    fn release_entry(&mut self, sequence: u64) {
        self.shared.lock_counter.journal_decrement(sequence);
    }

    /// Fail a request out of the journal, unwinding its allocation if it still has one.
    fn drain(&mut self, request: Box<Request>) {
        drain_request(&self.shared, request);
    }
}

/// Route a failed request out of the journal stage.
fn drain_request(shared: &Arc<Shared>, request: Box<Request>) {
    match request.zones.allocated {
        Some(zone) if request.allocation.is_some() => {
            shared
                .router
                .to_physical(zone, PhysicalMsg::Release { request, then: ReleaseThen::Ack });
        }
        _ => shared.router.to_ack(AckMsg::Complete(request)),
    }
}
