//! Raw callback records and zero-copy reinterpretation as typed records.
//!
//! A [`RawRecord`] is an arena owned by the native queue until it is released. A typed view
//! obtained from it is an overlay on the same bytes and borrows the record itself, so it
//! cannot outlive the record, and the record is consumed by its release (see
//! [`PoppedRecord`](crate::native::PoppedRecord)). Every crossing checks identifier, byte
//! length and alignment before the pointer cast.

use std::marker::PhantomData;
use std::mem::{align_of, size_of, MaybeUninit};
use std::slice;

use tracing::error;

use crate::native::FetchOutcome;
use crate::protocol::CallbackId;

/// A fixed-layout record the native library emits under a known identifier.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or `#[repr(transparent)]`), contain no implicit padding,
/// no pointers or references, and accept every bit pattern (use integers in place of `bool`
/// and enums). `size_of::<Self>()` must equal the native library's byte size for `ID`.
pub unsafe trait CallbackRecord: Copy + Send + Sync + 'static {
    const ID: CallbackId;
    const SIZE: usize = size_of::<Self>();

    /// The record's bytes in memory order.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: no padding and plain-data fields per the trait contract.
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

/// Why a raw record could not be viewed as the requested type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordMismatch {
    #[error("identifier mismatch: expected {expected}, record carries {actual}")]
    Identifier {
        expected: CallbackId,
        actual: CallbackId,
    },
    #[error("size mismatch for {id}: expected {expected} bytes, record carries {actual}")]
    Size {
        id: CallbackId,
        expected: usize,
        actual: usize,
    },
    #[error("payload for {id} is not aligned to {align} bytes")]
    Alignment { id: CallbackId, align: usize },
}

/// One callback popped from a native queue: owner, identifier, payload pointer and length.
/// Neither `Copy` nor `Clone`: views borrow this value, so dropping it ends them.
pub struct RawRecord<'a> {
    owner: i32,
    id: CallbackId,
    data: *const u8,
    len: usize,
    _payload: PhantomData<&'a [u8]>,
}

impl<'a> RawRecord<'a> {
    /// Wrap a payload handed out by the native layer.
    ///
    /// # Safety
    ///
    /// `data` must point to `len` readable bytes that stay valid and unmodified for as long
    /// as the returned record exists, and for no longer than `'a`. A queue handing out such a
    /// record may free the bytes only in an unsafe release the caller vouches for.
    pub unsafe fn from_raw_parts(owner: i32, id: CallbackId, data: *const u8, len: usize) -> Self {
        Self {
            owner,
            id,
            data,
            len,
            _payload: PhantomData,
        }
    }

    pub fn from_bytes(owner: i32, id: CallbackId, bytes: &'a [u8]) -> Self {
        Self {
            owner,
            id,
            data: bytes.as_ptr(),
            len: bytes.len(),
            _payload: PhantomData,
        }
    }

    /// Native user handle the record was posted for.
    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The payload bytes, valid until the record is released.
    pub fn payload(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: guaranteed by the constructor contract.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    /// Reinterpret the payload in place as `T`, or say why not.
    pub fn try_view<T: CallbackRecord>(&self) -> Result<&T, RecordMismatch> {
        if self.id != T::ID {
            return Err(RecordMismatch::Identifier {
                expected: T::ID,
                actual: self.id,
            });
        }
        if self.len != T::SIZE {
            return Err(RecordMismatch::Size {
                id: T::ID,
                expected: T::SIZE,
                actual: self.len,
            });
        }
        if self.data.is_null() || (self.data as usize) % align_of::<T>() != 0 {
            return Err(RecordMismatch::Alignment {
                id: T::ID,
                align: align_of::<T>(),
            });
        }
        // SAFETY: identifier, exact size and alignment checked above; any bit pattern is a
        // valid `T` and the bytes outlive this borrow of the record.
        Ok(unsafe { &*(self.data as *const T) })
    }

    /// Like [`try_view`](Self::try_view) but treats a mismatch as schema drift between this
    /// binding and the native library: assert in debug builds, log and refuse in release.
    pub fn view<T: CallbackRecord>(&self) -> Option<&T> {
        match self.try_view::<T>() {
            Ok(v) => Some(v),
            Err(err) => {
                error!(%err, owner = self.owner, "callback record schema mismatch");
                if cfg!(debug_assertions) {
                    panic!("callback record schema mismatch: {err}");
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for RawRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRecord")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

/// Let `fill` write a `T` into zeroed storage of exactly `T::SIZE` bytes.
/// The value is only meaningful when the returned outcome succeeded.
pub(crate) fn read_record<T, F>(fill: F) -> (FetchOutcome, T)
where
    T: CallbackRecord,
    F: FnOnce(&mut [u8]) -> FetchOutcome,
{
    let mut storage = MaybeUninit::<T>::zeroed();
    // SAFETY: zeroed storage is fully initialised bytes, sized and aligned for `T`.
    let buf = unsafe { slice::from_raw_parts_mut(storage.as_mut_ptr() as *mut u8, T::SIZE) };
    let outcome = fill(buf);
    // SAFETY: every bit pattern is a valid `T`.
    (outcome, unsafe { storage.assume_init() })
}
