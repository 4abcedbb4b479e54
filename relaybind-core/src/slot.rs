//! Result slot ("call task"): single-assignment result for one outstanding native call.
//!
//! Awaiting is a two-state handshake. Either the continuation is attached first and the
//! completer runs it, or completion happens first and the attacher runs it on the spot.
//! The slot's mutex decides which side wins; neither side holds it while the continuation runs.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::native::{CallHandle, NativeQueue, PipeHandle};
use crate::protocol::{CallCompleted, CallbackId};
use crate::record::{read_record, CallbackRecord};

/// Runs once with the call's outcome: `Some` on success, `None` on failure.
pub type Continuation<T> = Box<dyn FnOnce(Option<T>) + Send + 'static>;

enum Outcome<T> {
    Pending,
    Succeeded(T),
    Failed,
}

struct SlotState<T> {
    outcome: Outcome<T>,
    continuation: Option<Continuation<T>>,
}

/// Type-erased view of a pending slot, as stored in the registry.
pub trait PendingCall: Send + Sync {
    fn handle(&self) -> CallHandle;

    /// Identifier of the real result type this slot was created for.
    fn result_id(&self) -> CallbackId;

    /// Fetch the real result from the native layer and complete the slot.
    fn complete_from(&self, native: &dyn NativeQueue, pipe: PipeHandle, completion: &CallCompleted);
}

/// Shared handle to a pending slot, as handed out by the registry.
pub type SlotRef = Arc<dyn PendingCall>;

struct Slot<T> {
    handle: CallHandle,
    state: Mutex<SlotState<T>>,
}

impl<T: CallbackRecord> Slot<T> {
    fn is_completed(&self) -> bool {
        !matches!(self.state.lock().outcome, Outcome::Pending)
    }

    fn result(&self) -> Option<T> {
        match self.state.lock().outcome {
            Outcome::Succeeded(v) => Some(v),
            Outcome::Pending | Outcome::Failed => None,
        }
    }

    fn finish(&self, result: Option<T>) {
        let continuation = {
            let mut state = self.state.lock();
            if !matches!(state.outcome, Outcome::Pending) {
                warn!(call = %self.handle, "slot already completed; ignoring second completion");
                return;
            }
            state.outcome = match result {
                Some(v) => Outcome::Succeeded(v),
                None => Outcome::Failed,
            };
            state.continuation.take()
        };
        if let Some(cont) = continuation {
            cont(result);
        }
    }
}

impl<T: CallbackRecord> PendingCall for Slot<T> {
    fn handle(&self) -> CallHandle {
        self.handle
    }

    fn result_id(&self) -> CallbackId {
        T::ID
    }

    fn complete_from(&self, native: &dyn NativeQueue, pipe: PipeHandle, completion: &CallCompleted) {
        if self.is_completed() {
            // Fetching would consume a native result nobody can receive.
            warn!(call = %self.handle, "slot already completed; notification ignored");
            return;
        }
        if completion.handle() != self.handle
            || completion.result_id() != T::ID
            || completion.result_size() != T::SIZE
        {
            error!(
                call = %self.handle,
                notified_call = %completion.handle(),
                expected_id = %T::ID,
                expected_size = T::SIZE,
                actual_id = %completion.result_id(),
                actual_size = completion.result_size(),
                "call completion does not match its slot"
            );
            if cfg!(debug_assertions) {
                panic!(
                    "call completion for {} ({} / {} bytes) matched to slot {} expecting {} / {} bytes",
                    completion.handle(),
                    completion.result_id(),
                    completion.result_size(),
                    self.handle,
                    T::ID,
                    T::SIZE
                );
            }
            self.finish(None);
            return;
        }

        let (fetched, value) =
            read_record::<T, _>(|buf| native.fetch_call_result(pipe, self.handle, buf, T::ID));
        if fetched.succeeded() {
            self.finish(Some(value));
        } else {
            debug!(
                call = %self.handle,
                found = fetched.found,
                failed = fetched.failed,
                "call completed without a usable result"
            );
            self.finish(None);
        }
    }
}

/// Awaitable result of one asynchronous native call, typed by its result record.
pub struct CallTask<T: CallbackRecord> {
    slot: Arc<Slot<T>>,
}

impl<T: CallbackRecord> Clone for CallTask<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: CallbackRecord> CallTask<T> {
    pub(crate) fn new(handle: CallHandle) -> Self {
        Self {
            slot: Arc::new(Slot {
                handle,
                state: Mutex::new(SlotState {
                    outcome: Outcome::Pending,
                    continuation: None,
                }),
            }),
        }
    }

    pub(crate) fn slot_ref(&self) -> SlotRef {
        self.slot.clone()
    }

    pub fn handle(&self) -> CallHandle {
        self.slot.handle
    }

    pub fn is_completed(&self) -> bool {
        self.slot.is_completed()
    }

    /// The stored value once completed successfully; `None` while pending or after failure.
    pub fn get_result(&self) -> Option<T> {
        self.slot.result()
    }

    /// Run `cont` with the outcome. Runs immediately on this thread if the call already
    /// completed, otherwise on whichever thread completes it.
    ///
    /// One continuation per pending slot. A second one is refused (and asserts in debug
    /// builds) so the first waiter is never dropped; returns `false` when refused.
    pub fn attach_continuation<F>(&self, cont: F) -> bool
    where
        F: FnOnce(Option<T>) + Send + 'static,
    {
        let ready = {
            let mut guard = self.slot.state.lock();
            let state = &mut *guard;
            match state.outcome {
                Outcome::Pending => {
                    let taken = state.continuation.is_some();
                    if !taken {
                        state.continuation = Some(Box::new(cont));
                    }
                    drop(guard);
                    if taken {
                        warn!(call = %self.slot.handle, "continuation already attached; refused");
                        if cfg!(debug_assertions) {
                            panic!("continuation already attached to {}", self.slot.handle);
                        }
                    }
                    return !taken;
                }
                Outcome::Succeeded(v) => Some(v),
                Outcome::Failed => None,
            }
        };
        cont(ready);
        true
    }

    /// Complete this slot from a call-completed notification. See [`PendingCall::complete_from`].
    pub fn complete_from(
        &self,
        native: &dyn NativeQueue,
        pipe: PipeHandle,
        completion: &CallCompleted,
    ) {
        self.slot.complete_from(native, pipe, completion);
    }
}

impl<T: CallbackRecord> fmt::Debug for CallTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallTask")
            .field("handle", &self.slot.handle)
            .field("result_id", &T::ID)
            .field("completed", &self.is_completed())
            .finish()
    }
}
