//! The acknowledgement zone.
//!
//! The last stop of every request, success or failure: complete the host's future, then
//! unwind in order: hash-lock membership, the LBN lock (waking the next queued writer), and
//! finally the old mapping's decrement, which runs *after* the acknowledgement because the
//! host only cares that its data is durable, not that the replaced block has been returned to
//! the free pool.
//!
//! FUA writes detour through the journal once more on their way in, so the acknowledgement
//! happens strictly after the journal is flushed to stable storage.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::device::Shared;
use crate::zone::{AckMsg, HashMsg, JournalMsg, LogicalMsg, PhysicalMsg};

/// The acknowledgement zone thread.
pub fn run(shared: Arc<Shared>, rx: Receiver<AckMsg>) {
    let log = shared.log.new(o!("zone" => "ack"));
    while let Ok(msg) = rx.recv() {
        match msg {
            AckMsg::Complete(mut request) => {
                if request.fua
                    && !request.fua_synced
                    && request.error.is_none()
                    && request.journal_point.is_some()
                {
                    // FUA: one round through the journal flush before acknowledging.
                    request.fua_synced = true;
                    shared.router.to_journal(JournalMsg::FuaFlush(request));
                    continue;
                }

                // An agent that published its allocation is done with the write lease: the
                // journaled reference keeps the block alive from here on. Most failed
                // requests arrive with the lease already released; a FUA write that failed
                // only at its final flush still carries one. The release is registered with
                // the gate before this operation retires, so quiesce observes settled counts.
                if let Some(pbn) = request.allocation.take() {
                    shared.gate.internal_started();
                    let zone = shared.zone_of_pbn(pbn);
                    shared.router.to_physical(zone, PhysicalMsg::ReleaseLease { pbn });
                }
                trace!(log, "completing request";
                       "lbn" => request.lbn, "ok" => request.error.is_none());
                request.finish();

                if request.in_hash_lock {
                    request.in_hash_lock = false;
                    let zone = request.zones.hash.expect("hash member without a zone");
                    let fingerprint =
                        request.fingerprint.expect("hash member without a fingerprint");
                    // Gated like the lease release: dropping the last membership may free
                    // the lock's lease, and that must not outrun a quiesce.
                    shared.gate.internal_started();
                    shared.router.to_hash(zone, HashMsg::Release { fingerprint });
                }

                if request.holds_lbn_lock {
                    request.holds_lbn_lock = false;
                    shared
                        .router
                        .to_logical(request.zones.logical, LogicalMsg::ReleaseLock {
                            lbn: request.lbn,
                        });
                }

                // Stage 12: the replaced mapping's decrement, scheduled after the host has
                // its answer. The journal entry stays open until the decrement lands.
                if let Some(point) = request.journal_point {
                    if request.error.is_none() && request.old_mapping.is_counted() {
                        shared.gate.internal_started();
                        let pbn = request.old_mapping.pbn;
                        let zone = shared.zone_of_pbn(pbn);
                        shared.router.to_physical(zone, PhysicalMsg::RefDec { pbn, point });
                    } else {
                        shared
                            .router
                            .to_journal(JournalMsg::EntryClosed { sequence: point.sequence });
                    }
                }

                shared.gate.op_finished();
            }
            AckMsg::Shutdown => break,
        }
    }
}
