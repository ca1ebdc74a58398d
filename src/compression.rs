//! The per-request compression state machine.
//!
//! Whether a request may still be compressed is the one piece of per-request state that crosses
//! zones: the CPU worker advances it, the packer advances it, and a *different* request on a
//! different thread may cancel it (a newer write to the same LBN mooting an older one that is
//! still parked in a packer bin). It therefore lives in a single atomic word rather than inside
//! any zone's structures.
//!
//! The word encodes `(stage, veto)`: the low byte is the stage, the high bit is the
//! may-not-compress veto. Stages advance monotonically through
//! `NotStarted → Compressing → Packing → Writing → PostPacker`, except that a set veto makes
//! the next advance jump straight to `PostPacker`. `PostPacker` is terminal. A request whose
//! veto was ever set must be written as an uncompressed block.

use std::sync::atomic::{AtomicU32, Ordering};

/// The compression stage of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Compression has not been considered yet.
    NotStarted = 0,
    /// A CPU worker is compressing the data.
    Compressing = 1,
    /// The request sits in a packer bin.
    Packing = 2,
    /// The request is a member of a bin being written out.
    Writing = 3,
    /// The request is past the packer, for better or worse.
    PostPacker = 4,
}

impl Stage {
    /// Decode a stage from the low byte of the word.
    fn from_bits(bits: u32) -> Stage {
        match bits & 0xFF {
            0 => Stage::NotStarted,
            1 => Stage::Compressing,
            2 => Stage::Packing,
            3 => Stage::Writing,
            _ => Stage::PostPacker,
        }
    }

    /// The stage an advance moves to.
    fn next(self) -> Stage {
        match self {
            Stage::NotStarted => Stage::Compressing,
            Stage::Compressing => Stage::Packing,
            Stage::Packing => Stage::Writing,
            Stage::Writing | Stage::PostPacker => Stage::PostPacker,
        }
    }
}

/// The may-not-compress veto bit.
const VETO: u32 = 1 << 31;

/// The atomic `(stage, veto)` word of one request.
#[derive(Debug)]
pub struct CompressionStatus {
    /// The packed word.
    word: AtomicU32,
}

impl CompressionStatus {
    /// A fresh status: `NotStarted`, no veto.
    pub fn new() -> CompressionStatus {
        CompressionStatus { word: AtomicU32::new(Stage::NotStarted as u32) }
    }

    /// Read the current `(stage, veto)` pair.
    pub fn load(&self) -> (Stage, bool) {
        let word = self.word.load(Ordering::Acquire);
        (Stage::from_bits(word), word & VETO != 0)
    }

    /// Is the veto set?
    pub fn may_not_compress(&self) -> bool {
        self.word.load(Ordering::Acquire) & VETO != 0
    }

    /// Advance to the next stage.
    ///
    /// If the veto is set, the advance jumps straight to `PostPacker`. Returns the stage that
    /// was advanced *to*; the caller branches on it, since a concurrent cancel may have turned
    /// an expected `Packing` into a `PostPacker`.
    pub fn advance(&self) -> Stage {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let stage = Stage::from_bits(current);
            let vetoed = current & VETO != 0;
            let next = if vetoed { Stage::PostPacker } else { stage.next() };
            let replacement = next as u32 | (current & VETO);
            match self.word.compare_exchange_weak(
                current,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Set the veto.
    ///
    /// Returns `true` iff the caller was the first canceller *and* the request was in
    /// `Packing`: that combination means the request is parked in a packer bin with nobody else
    /// about to move it, so the canceller is responsible for dislodging it.
    pub fn cancel(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & VETO != 0 {
                // Someone already cancelled; they took whatever responsibility there was.
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current | VETO,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Stage::from_bits(current) == Stage::Packing,
                Err(observed) => current = observed,
            }
        }
    }

    /// Force the terminal state: `PostPacker` with the veto set.
    ///
    /// Used when a request is decided to be uncompressible before it ever enters the pipeline
    /// (no allocation, FUA, compression disabled). Idempotent.
    pub fn set_done(&self) {
        self.word.store(Stage::PostPacker as u32 | VETO, Ordering::Release);
    }
}

impl Default for CompressionStatus {
    fn default() -> CompressionStatus {
        CompressionStatus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_in_order() {
        let status = CompressionStatus::new();
        assert_eq!(status.load(), (Stage::NotStarted, false));
        assert_eq!(status.advance(), Stage::Compressing);
        assert_eq!(status.advance(), Stage::Packing);
        assert_eq!(status.advance(), Stage::Writing);
        assert_eq!(status.advance(), Stage::PostPacker);
        // Terminal.
        assert_eq!(status.advance(), Stage::PostPacker);
    }

    #[test]
    fn veto_jumps_to_post_packer() {
        let status = CompressionStatus::new();
        status.advance();
        assert!(!status.cancel());
        assert!(status.may_not_compress());
        assert_eq!(status.advance(), Stage::PostPacker);
    }

    #[test]
    fn first_packing_canceller_is_responsible() {
        let status = CompressionStatus::new();
        status.advance();
        status.advance();
        assert_eq!(status.load(), (Stage::Packing, false));

        // The first canceller in `Packing` must dislodge the request.
        assert!(status.cancel());
        // The second gets nothing to do.
        assert!(!status.cancel());
    }

    #[test]
    fn set_done_is_idempotent_and_terminal() {
        let status = CompressionStatus::new();
        status.set_done();
        status.set_done();
        assert_eq!(status.load(), (Stage::PostPacker, true));
        assert_eq!(status.advance(), Stage::PostPacker);
        assert!(!status.cancel());
    }

    #[test]
    fn concurrent_cancel_and_advance_serialize() {
        use std::sync::Arc;
        use std::thread;

        // Whatever the interleaving, exactly one canceller may win responsibility, and the
        // final state must be PostPacker + veto.
        for _ in 0..64 {
            let status = Arc::new(CompressionStatus::new());
            status.advance();
            status.advance();

            let mut handles = Vec::new();
            for _ in 0..4 {
                let status = Arc::clone(&status);
                handles.push(thread::spawn(move || status.cancel() as usize));
            }
            let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(winners, 1);

            assert_eq!(status.advance(), Stage::PostPacker);
            assert_eq!(status.load(), (Stage::PostPacker, true));
        }
    }
}
