//! C ABI of the native library's manual-dispatch entry points.
//! Linking is opt-in through the `native` feature; the message layout is always available.

use std::os::raw::c_int;

use crate::protocol::CallbackId;
use crate::record::RawRecord;

/// One queued callback as the native library hands it out.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallbackMsg {
    pub user: i32,
    pub callback: c_int,
    pub param: *mut u8,
    pub param_len: c_int,
}

impl CallbackMsg {
    pub fn empty() -> Self {
        Self {
            user: 0,
            callback: 0,
            param: std::ptr::null_mut(),
            param_len: 0,
        }
    }

    /// View this message as a raw record. A negative length is treated as empty.
    ///
    /// # Safety
    ///
    /// `param` must be valid for `param_len` bytes for as long as the returned record exists
    /// and no longer than `'a`, i.e. until the message is freed.
    pub unsafe fn as_record<'a>(&self) -> RawRecord<'a> {
        let len = usize::try_from(self.param_len).unwrap_or(0);
        unsafe { RawRecord::from_raw_parts(self.user, CallbackId(self.callback), self.param, len) }
    }
}

#[cfg(feature = "native")]
mod sys {
    use std::ffi::c_void;
    use std::os::raw::c_int;

    use super::CallbackMsg;

    #[link(name = "steam_api")]
    extern "C" {
        pub fn SteamAPI_ManualDispatch_Init();
        pub fn SteamAPI_GetHSteamPipe() -> i32;
        pub fn SteamAPI_ManualDispatch_RunFrame(pipe: i32);
        pub fn SteamAPI_ManualDispatch_GetNextCallback(pipe: i32, msg: *mut CallbackMsg) -> bool;
        pub fn SteamAPI_ManualDispatch_FreeLastCallback(pipe: i32);
        pub fn SteamAPI_ManualDispatch_GetAPICallResult(
            pipe: i32,
            call: u64,
            out: *mut c_void,
            out_len: c_int,
            expected: c_int,
            failed: *mut bool,
        ) -> bool;
    }
}

#[cfg(feature = "native")]
pub use library::NativeLibrary;

#[cfg(feature = "native")]
mod library {
    use std::collections::HashSet;
    use std::os::raw::c_int;

    use parking_lot::Mutex;
    use tracing::{error, warn};

    use super::{sys, CallbackMsg};
    use crate::native::{CallHandle, FetchOutcome, NativeQueue, PipeHandle};
    use crate::protocol::CallbackId;
    use crate::record::RawRecord;

    /// The linked native library in manual-dispatch mode.
    pub struct NativeLibrary {
        /// Pipes with a popped record not yet freed.
        outstanding: Mutex<HashSet<PipeHandle>>,
    }

    impl NativeLibrary {
        /// Switch the native library to manual dispatch.
        ///
        /// # Safety
        ///
        /// The native library must be initialised and no other code may be draining its
        /// callback queues.
        pub unsafe fn init() -> Self {
            unsafe { sys::SteamAPI_ManualDispatch_Init() };
            Self {
                outstanding: Mutex::new(HashSet::new()),
            }
        }

        /// The pipe of the process's default user.
        pub fn default_pipe(&self) -> PipeHandle {
            PipeHandle(unsafe { sys::SteamAPI_GetHSteamPipe() })
        }
    }

    // SAFETY: the library keeps a popped payload until FreeLastCallback, and `outstanding`
    // refuses a second pop on a pipe before that.
    unsafe impl NativeQueue for NativeLibrary {
        fn advance_frame(&self, pipe: PipeHandle) {
            unsafe { sys::SteamAPI_ManualDispatch_RunFrame(pipe.0) };
        }

        fn pop_next_record(&self, pipe: PipeHandle) -> Option<RawRecord<'_>> {
            let mut outstanding = self.outstanding.lock();
            if outstanding.contains(&pipe) {
                error!(%pipe, "pop before the previous record was released");
                return None;
            }
            let mut msg = CallbackMsg::empty();
            if !unsafe { sys::SteamAPI_ManualDispatch_GetNextCallback(pipe.0, &mut msg) } {
                return None;
            }
            outstanding.insert(pipe);
            // SAFETY: the library keeps the payload alive until FreeLastCallback, which only
            // the unsafe `release_record` calls.
            Some(unsafe { msg.as_record() })
        }

        unsafe fn release_record(&self, pipe: PipeHandle) {
            if self.outstanding.lock().remove(&pipe) {
                unsafe { sys::SteamAPI_ManualDispatch_FreeLastCallback(pipe.0) };
            } else {
                warn!(%pipe, "release without a popped record");
            }
        }

        fn fetch_call_result(
            &self,
            pipe: PipeHandle,
            handle: CallHandle,
            out: &mut [u8],
            expected: CallbackId,
        ) -> FetchOutcome {
            let Ok(out_len) = c_int::try_from(out.len()) else {
                return FetchOutcome::default();
            };
            let mut failed = false;
            let found = unsafe {
                sys::SteamAPI_ManualDispatch_GetAPICallResult(
                    pipe.0,
                    handle.0,
                    out.as_mut_ptr().cast(),
                    out_len,
                    expected.0,
                    &mut failed,
                )
            };
            FetchOutcome { found, failed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_converts_to_record() {
        let mut words = [0u64; 2];
        let mut msg = CallbackMsg::empty();
        msg.user = 3;
        msg.callback = 703;
        msg.param = words.as_mut_ptr().cast();
        msg.param_len = 16;
        let record = unsafe { msg.as_record() };
        assert_eq!(record.owner(), 3);
        assert_eq!(record.id(), CallbackId(703));
        assert_eq!(record.len(), 16);
    }

    #[test]
    fn negative_length_is_empty() {
        let mut msg = CallbackMsg::empty();
        msg.param_len = -4;
        let record = unsafe { msg.as_record() };
        assert!(record.is_empty());
        assert!(record.payload().is_empty());
    }
}
