//! CPU workers: fingerprinting and compression.
//!
//! Hashing and compressing are embarrassingly parallel and touch no shared state, so the
//! workers are a flat pool draining one queue rather than zones with owned partitions. A
//! worker decides nothing about coordination; it computes, records the result on the request,
//! and routes the request to the zone that does decide.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;

use crate::codec;
use crate::compression::Stage;
use crate::device::Shared;
use crate::fingerprint::Fingerprint;
use crate::request::Request;
use crate::zone::{CpuMsg, HashMsg, PackerMsg, PhysicalMsg, WriteThen};

/// A CPU worker thread.
pub fn run(worker: usize, shared: Arc<Shared>, rx: Receiver<CpuMsg>) {
    let log = shared.log.new(o!("zone" => format!("cpu-{}", worker)));
    while let Ok(msg) = rx.recv() {
        match msg {
            CpuMsg::Hash(mut request) => {
                // Stage 3: fingerprint and route to the owning hash zone. Zero blocks never
                // get here; they short-circuit at launch.
                let data = request.data.as_ref().expect("hashing without data");
                let fingerprint = Fingerprint::new(data);
                request.fingerprint = Some(fingerprint);
                let zone = fingerprint.zone(shared.config.hash_zones);
                request.zones.hash = Some(zone);
                trace!(log, "fingerprinted"; "lbn" => request.lbn);
                shared.router.to_hash(zone, HashMsg::Acquire(request));
            }
            CpuMsg::Compress(request) => compress(&shared, request),
            CpuMsg::Shutdown => break,
        }
    }

    /// Stage 7: compress and decide whether packing is worthwhile.
    fn compress(shared: &Arc<Shared>, mut request: Box<Request>) {
        let data = request.data.as_ref().expect("compressing without data");
        let fragment = codec::compress(data);

        let fits = fragment.len() <= codec::payload_capacity()
            && shared.compression_enabled.load(Ordering::Acquire);
        if fits {
            request.compressed = Some(fragment);
            // Compressing → Packing, unless a moot vetoed it while we were working.
            if request.compression.advance() == Stage::Packing {
                shared.router.to_packer(PackerMsg::Admit(request));
                return;
            }
        } else {
            request.compression.set_done();
        }

        // Incompressible or vetoed: write the whole block to the request's own allocation.
        let zone = request.zones.allocated.expect("compression without an allocation");
        shared
            .router
            .to_physical(zone, PhysicalMsg::WriteData { request, then: WriteThen::HashLock });
    }
}
