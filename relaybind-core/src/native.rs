//! Boundary with the native networking library: the only calls the dispatch core makes.
//! Implemented by `ffi::NativeLibrary` (real library, `native` feature) and `loopback::LoopbackNative`.

use std::fmt;
use std::ops::Deref;

use crate::protocol::CallbackId;
use crate::record::RawRecord;

/// Native pipe handle. One callback queue per pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeHandle(pub i32);

impl fmt::Display for PipeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Opaque 64-bit id for one outstanding asynchronous native request. Process-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallHandle(pub u64);

impl CallHandle {
    /// Sentinel the native layer returns when a request could not be started.
    pub const INVALID: CallHandle = CallHandle(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{:#x}", self.0)
    }
}

/// Result of asking the native layer for a completed call's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOutcome {
    /// The native layer had a result for this handle and copied it out.
    pub found: bool,
    /// The call itself failed; the copied bytes are not meaningful.
    pub failed: bool,
}

impl FetchOutcome {
    pub fn succeeded(self) -> bool {
        self.found && !self.failed
    }
}

/// Opaque calls into the native library's callback queue.
///
/// Implementations must tolerate a producer enqueuing records on another thread while a
/// pump is popping; the core never assumes exclusive producer access.
///
/// # Safety
///
/// A record returned by `pop_next_record` must stay valid and unmodified until
/// `release_record` is called for its pipe, and `pop_next_record` must return `None` for a
/// pipe whose last popped record has not been released yet. [`PoppedRecord`] relies on both.
pub unsafe trait NativeQueue: Send + Sync {
    /// Housekeeping for one frame. Called once at the start of every pump.
    fn advance_frame(&self, pipe: PipeHandle);

    /// Non-blocking dequeue. The returned record stays valid until `release_record`.
    /// Prefer [`PoppedRecord::pop`], which releases for you.
    fn pop_next_record(&self, pipe: PipeHandle) -> Option<RawRecord<'_>>;

    /// Free the most recently popped record.
    ///
    /// # Safety
    ///
    /// Exactly once per popped record, and only after the record and every view into it are
    /// gone.
    unsafe fn release_record(&self, pipe: PipeHandle);

    /// Copy the real result of a completed call into `out`, which is sized exactly to the
    /// expected record type identified by `expected`.
    fn fetch_call_result(
        &self,
        pipe: PipeHandle,
        handle: CallHandle,
        out: &mut [u8],
        expected: CallbackId,
    ) -> FetchOutcome;
}

/// A popped record that is released when dropped, on every path including unwinding.
/// Views borrow the guard, so none of them can outlive the release:
///
/// ```compile_fail
/// use relaybind_core::protocol::{Availability, RelayNetworkStatus};
/// use relaybind_core::{LoopbackNative, PoppedRecord};
///
/// let native = LoopbackNative::new();
/// let pipe = native.create_pipe();
/// native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, "up"));
/// let popped = PoppedRecord::pop(&native, pipe).unwrap();
/// let status = popped.view::<RelayNetworkStatus>().unwrap();
/// drop(popped);
/// let _ = status.availability();
/// ```
///
/// Releasing by hand is unsafe:
///
/// ```compile_fail
/// use relaybind_core::{LoopbackNative, NativeQueue};
///
/// let native = LoopbackNative::new();
/// let pipe = native.create_pipe();
/// native.release_record(pipe);
/// ```
pub struct PoppedRecord<'q> {
    native: &'q dyn NativeQueue,
    pipe: PipeHandle,
    record: RawRecord<'q>,
}

impl<'q> PoppedRecord<'q> {
    /// Pop the next record on `pipe`, if any.
    pub fn pop(native: &'q dyn NativeQueue, pipe: PipeHandle) -> Option<Self> {
        let record = native.pop_next_record(pipe)?;
        Some(Self {
            native,
            pipe,
            record,
        })
    }

    pub fn pipe(&self) -> PipeHandle {
        self.pipe
    }
}

impl<'q> Deref for PoppedRecord<'q> {
    type Target = RawRecord<'q>;

    fn deref(&self) -> &RawRecord<'q> {
        &self.record
    }
}

impl Drop for PoppedRecord<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard was the only owner of the record and views borrow the guard,
        // so nothing refers to the payload any more.
        unsafe { self.native.release_record(self.pipe) };
    }
}

impl fmt::Debug for PoppedRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoppedRecord")
            .field("pipe", &self.pipe)
            .field("record", &self.record)
            .finish()
    }
}
