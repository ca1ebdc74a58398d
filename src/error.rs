//! Error handling.
//!
//! Every failure the device can report to a host or an administrator is a variant of [`Error`].
//! The write path propagates errors explicitly: a request that fails carries its error to the
//! acknowledgement stage, which releases whatever leases and locks the request still holds and
//! then completes the host's future with the error. Nothing in the data path panics on a failed
//! request.
//!
//! Two of the variants are sticky at the device level: an I/O error or a corruption detected on
//! *metadata* (the recovery journal) moves the whole device into read-only mode, after which all
//! in-flight and future writes fail with [`Error::ReadOnly`] while reads continue.

use std::io;

quick_error! {
    /// A device error.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Error {
        /// Physical space is exhausted and deduplication could not absorb the write.
        ///
        /// This is only reported when a write reached the point of needing its own physical
        /// block and none could be provided. A write that deduplicates against existing content
        /// succeeds even on a full device.
        NoSpace {
            display("no physical space available")
        }
        /// A block number lies outside the configured device.
        OutOfRange { block: u64, limit: u64 } {
            display("block {} out of range (device has {} blocks)", block, limit)
        }
        /// The operation is not permitted in the current administrative state.
        InvalidAdminState { operation: &'static str } {
            display("operation '{}' not permitted in the current admin state", operation)
        }
        /// The device is in read-only mode.
        ///
        /// Entered when metadata fails; sticky until the device is shut down and rebuilt by an
        /// external tool.
        ReadOnly {
            display("device is in read-only mode")
        }
        /// The backing device failed a request.
        Io(reason: String) {
            display("I/O error: {}", reason)
            from(err: io::Error) -> (err.to_string())
        }
        /// A metadata block failed validation.
        MetadataCorruption(reason: String) {
            display("metadata corruption: {}", reason)
        }
        /// A grow operation was prepared for different dimensions than it was applied with.
        ParameterMismatch { prepared: u64, applied: u64 } {
            display("grow prepared for {} blocks but applied with {}", prepared, applied)
        }
        /// Another administrative operation is in progress.
        ComponentBusy {
            display("another administrative operation is in progress")
        }
    }
}

/// A device result.
pub type Result<T> = ::std::result::Result<T, Error>;
