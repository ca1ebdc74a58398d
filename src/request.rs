//! The per-block request object.
//!
//! Every host operation on a single block becomes one [`Request`]: the unit that travels the
//! data path. A request is owned by exactly one zone at any instant; zones hand it to each
//! other by sending the box over the fabric's channels, or park it in their waiter structures
//! (an LBN lock queue, a hash lock's member list, a packer bin). Because ownership is unique,
//! nothing on a request needs a lock, with one deliberate exception: the shared
//! [`CompressionStatus`](crate::compression::CompressionStatus) word, whose whole point is to
//! be poked from other zones.
//!
//! # The write path
//!
//! A write advances through these stages, each on the owning zone's thread:
//!
//! 1. *Launch* (logical zone): acquire the LBN lock, read the old mapping.
//! 2. *Allocate* (physical zone): reserve a provisional PBN; failure is survivable.
//! 3. *Hash* (CPU worker): fingerprint the payload; zero blocks short-circuit to 9.
//! 4. *Acquire hash lock* (hash zone): one agent per fingerprint, others wait.
//! 5. *Dedupe query* (hash zone): consult the advice oracle.
//! 6. *Verify* (physical zone of the candidate): byte-compare against the advised block.
//! 7. *Compress* (CPU worker) and 8. *pack* (packer zone), if still eligible.
//! 9. *Journal* (journal zone): make the mapping change durable.
//! 10. *Map update* (logical zone): install the new mapping, count the new reference.
//! 11. *Acknowledge* (ack zone): complete the host future, release locks.
//! 12. *Decrement* (physical zone of the old block): release the replaced reference.
//!
//! Reads only touch stages 1, a physical fetch, and 11. Trims skip 2–8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::executor::block_on;

use crate::block::{zero_buf, BlockBuf, Lbn, Mapping};
use crate::compression::CompressionStatus;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::journal::JournalPoint;

/// The kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Return the current content of a logical block.
    Read,
    /// Install new content for a logical block.
    Write,
    /// Drop the mapping of a logical block.
    Trim,
}

/// The zone assignments a request resolves as it goes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneSet {
    /// The logical zone owning the LBN. Resolved at submit.
    pub logical: usize,
    /// The hash zone owning the fingerprint, once hashed.
    pub hash: Option<usize>,
    /// The physical zone the allocation came from, if any.
    pub allocated: Option<usize>,
    /// The physical zone of the duplicate candidate under verification, if any.
    pub duplicate: Option<usize>,
}

/// How a request reports back to the host.
pub enum Completion {
    /// A write or flush future.
    Write(oneshot::Sender<Result<()>>),
    /// A read future carrying the payload.
    Read(oneshot::Sender<Result<BlockBuf>>),
    /// One block of a multi-block trim.
    Batch(Arc<BatchCompletion>),
    /// Nothing to report (already completed, or internal).
    None,
}

/// The shared completion of a multi-block trim.
///
/// The host gets one future for the whole range; it resolves when the last per-block request
/// finishes, with the first error if any block failed.
pub struct BatchCompletion {
    /// Blocks still in flight.
    remaining: AtomicUsize,
    /// The first error observed.
    failed: Mutex<Option<Error>>,
    /// The host's future, taken by whoever finishes last.
    sender: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl BatchCompletion {
    /// A batch of `count` blocks reporting to `sender`.
    pub fn new(count: usize, sender: oneshot::Sender<Result<()>>) -> Arc<BatchCompletion> {
        Arc::new(BatchCompletion {
            remaining: AtomicUsize::new(count),
            failed: Mutex::new(None),
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Record one finished block.
    fn complete_one(&self, result: Result<()>) {
        if let Err(err) = result {
            let mut failed = self.failed.lock().unwrap();
            failed.get_or_insert(err);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last one out reports.
            let verdict = match self.failed.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            };
            if let Some(sender) = self.sender.lock().unwrap().take() {
                let _ = sender.send(verdict);
            }
        }
    }
}

/// One in-flight block operation.
pub struct Request {
    /// A device-unique id, used to find this request when it is parked elsewhere (packer
    /// removal, LBN lock bookkeeping).
    pub id: u64,
    /// What the host asked for.
    pub op: Op,
    /// Force-unit-access: the journal is flushed before this write acknowledges, and the
    /// payload never enters the compression path.
    pub fua: bool,
    /// The logical block.
    pub lbn: Lbn,
    /// The write payload, or the read result once fetched.
    pub data: Option<BlockBuf>,
    /// Whether the payload is all zeroes. Decided once at submit.
    pub is_zero: bool,
    /// The mapping read from the block map under the LBN lock.
    pub old_mapping: Mapping,
    /// The mapping this request is trying to install.
    pub new_mapping: Mapping,
    /// The provisionally leased PBN, if allocation succeeded.
    pub allocation: Option<u64>,
    /// How many physical zones allocation has been attempted on.
    pub alloc_attempts: usize,
    /// The content fingerprint; present iff the content is non-zero and hashed.
    pub fingerprint: Option<Fingerprint>,
    /// Whether this request is in a hash lock's member set.
    pub in_hash_lock: bool,
    /// Set once the oracle or verification concludes the content is a duplicate.
    pub is_duplicate: bool,
    /// The candidate PBN under verification.
    pub duplicate: Option<u64>,
    /// The cross-zone compression word.
    pub compression: Arc<CompressionStatus>,
    /// The compressed payload, once the CPU worker has run.
    pub compressed: Option<Vec<u8>>,
    /// The slot this request occupies in its packed block.
    pub slot: u8,
    /// Where this request's journal entry landed.
    pub journal_point: Option<JournalPoint>,
    /// The resolved zone assignments.
    pub zones: ZoneSet,
    /// Whether this request currently holds its LBN lock.
    pub holds_lbn_lock: bool,
    /// Whether the FUA journal flush has already run for this request.
    pub fua_synced: bool,
    /// The host's future.
    pub completion: Completion,
    /// The first error this request hit, if any.
    pub error: Option<Error>,
}

impl Request {
    /// Construct a request skeleton.
    fn new(id: u64, op: Op, lbn: Lbn, completion: Completion) -> Request {
        Request {
            id,
            op,
            fua: false,
            lbn,
            data: None,
            is_zero: false,
            old_mapping: Mapping::unmapped(),
            new_mapping: Mapping::unmapped(),
            allocation: None,
            alloc_attempts: 0,
            fingerprint: None,
            in_hash_lock: false,
            is_duplicate: false,
            duplicate: None,
            compression: Arc::new(CompressionStatus::new()),
            compressed: None,
            slot: 0,
            journal_point: None,
            zones: ZoneSet::default(),
            holds_lbn_lock: false,
            fua_synced: false,
            completion,
            error: None,
        }
    }

    /// A write request.
    pub fn write(
        id: u64,
        lbn: Lbn,
        data: BlockBuf,
        is_zero: bool,
        fua: bool,
        sender: oneshot::Sender<Result<()>>,
    ) -> Box<Request> {
        let mut request = Request::new(id, Op::Write, lbn, Completion::Write(sender));
        request.data = Some(data);
        request.is_zero = is_zero;
        request.fua = fua;
        Box::new(request)
    }

    /// A read request.
    pub fn read(id: u64, lbn: Lbn, sender: oneshot::Sender<Result<BlockBuf>>) -> Box<Request> {
        Box::new(Request::new(id, Op::Read, lbn, Completion::Read(sender)))
    }

    /// One block of a trim.
    pub fn trim(id: u64, lbn: Lbn, batch: Arc<BatchCompletion>) -> Box<Request> {
        Box::new(Request::new(id, Op::Trim, lbn, Completion::Batch(batch)))
    }

    /// Record a failure.
    ///
    /// The first error sticks; later ones on the same request are consequences of unwinding
    /// and would only obscure the cause.
    pub fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// The request's outcome so far.
    pub fn result(&self) -> Result<()> {
        match self.error {
            Some(ref err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Complete the host's future.
    ///
    /// Consumes the completion; calling twice is a no-op, which the error-unwind path relies
    /// on.
    pub fn finish(&mut self) {
        let result = self.result();
        match std::mem::replace(&mut self.completion, Completion::None) {
            Completion::Write(sender) => {
                let _ = sender.send(result);
            }
            Completion::Read(sender) => {
                let payload = match result {
                    Ok(()) => Ok(self.data.take().unwrap_or_else(zero_buf)),
                    Err(err) => Err(err),
                };
                let _ = sender.send(payload);
            }
            Completion::Batch(batch) => batch.complete_one(result),
            Completion::None => {}
        }
    }
}

/// An acknowledgement future for a write, trim, or flush.
///
/// May be polled as a future or synchronously waited on.
pub struct Ack {
    /// The completion channel.
    receiver: oneshot::Receiver<Result<()>>,
}

impl Ack {
    /// Wrap a completion channel.
    pub fn new(receiver: oneshot::Receiver<Result<()>>) -> Ack {
        Ack { receiver }
    }

    /// An acknowledgement that already failed at submit.
    pub fn failed(error: Error) -> Ack {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Ack { receiver }
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<()> {
        block_on(self.receiver).unwrap_or_else(|_| Err(Error::Io("device shut down".into())))
    }
}

impl std::future::Future for Ack {
    type Output = Result<()>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(Error::Io("device shut down".into()))))
    }
}

/// An acknowledgement future for a read, resolving to the payload.
pub struct ReadAck {
    /// The completion channel.
    receiver: oneshot::Receiver<Result<BlockBuf>>,
}

impl ReadAck {
    /// Wrap a completion channel.
    pub fn new(receiver: oneshot::Receiver<Result<BlockBuf>>) -> ReadAck {
        ReadAck { receiver }
    }

    /// A read that already failed at submit.
    pub fn failed(error: Error) -> ReadAck {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        ReadAck { receiver }
    }

    /// Block until the read completes and return the payload.
    pub fn wait(self) -> Result<BlockBuf> {
        block_on(self.receiver).unwrap_or_else(|_| Err(Error::Io("device shut down".into())))
    }
}

impl std::future::Future for ReadAck {
    type Output = Result<BlockBuf>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(Error::Io("device shut down".into()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_sticks() {
        let (sender, _receiver) = oneshot::channel();
        let mut request = Request::write(1, 0, zero_buf(), true, false, sender);
        request.fail(Error::NoSpace);
        request.fail(Error::ReadOnly);
        assert_eq!(request.result(), Err(Error::NoSpace));
    }

    #[test]
    fn finish_is_single_shot() {
        let (sender, receiver) = oneshot::channel();
        let mut request = Request::write(1, 0, zero_buf(), true, false, sender);
        request.finish();
        request.finish();
        assert_eq!(Ack::new(receiver).wait(), Ok(()));
    }

    #[test]
    fn batch_reports_first_error() {
        let (sender, receiver) = oneshot::channel();
        let batch = BatchCompletion::new(3, sender);
        batch.complete_one(Ok(()));
        batch.complete_one(Err(Error::NoSpace));
        batch.complete_one(Err(Error::ReadOnly));
        assert_eq!(Ack::new(receiver).wait(), Err(Error::NoSpace));
    }

    #[test]
    fn dropped_device_surfaces_as_error() {
        let (sender, receiver) = oneshot::channel::<Result<()>>();
        drop(sender);
        assert!(Ack::new(receiver).wait().is_err());
    }
}
