//! Call result registry: call handle -> pending result slot.
//!
//! One mutex per registry covers insert and lookup+remove. Removal happens before completion
//! is attempted, so a duplicate or racing notification for the same handle finds nothing.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::native::CallHandle;
use crate::record::CallbackRecord;
use crate::slot::{CallTask, SlotRef};

#[derive(Default)]
pub struct CallResultRegistry {
    pending: Mutex<HashMap<CallHandle, SlotRef>>,
}

impl CallResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh pending slot for `handle`. Returns `None` for the invalid handle:
    /// the native call never started and there is nothing to wait on.
    ///
    /// Prefer [`issue`](Self::issue) when the native call may complete on another thread
    /// before this returns.
    pub fn register<T: CallbackRecord>(&self, handle: CallHandle) -> Option<CallTask<T>> {
        if !handle.is_valid() {
            debug!(result_id = %T::ID, "native call failed to start; nothing registered");
            return None;
        }
        let mut pending = self.pending.lock();
        Some(Self::insert_locked(&mut pending, handle))
    }

    /// Start a native call with `start` and register its handle in one critical section, so
    /// a concurrent pump cannot see the completion before the slot exists.
    ///
    /// `start` runs with the registry locked and must not call back into this registry.
    pub fn issue<T, F>(&self, start: F) -> Option<CallTask<T>>
    where
        T: CallbackRecord,
        F: FnOnce() -> CallHandle,
    {
        let mut pending = self.pending.lock();
        let handle = start();
        if !handle.is_valid() {
            debug!(result_id = %T::ID, "native call failed to start; nothing registered");
            return None;
        }
        Some(Self::insert_locked(&mut pending, handle))
    }

    fn insert_locked<T: CallbackRecord>(
        pending: &mut HashMap<CallHandle, SlotRef>,
        handle: CallHandle,
    ) -> CallTask<T> {
        let task = CallTask::<T>::new(handle);
        if let Some(stale) = pending.insert(handle, task.slot_ref()) {
            warn!(
                call = %handle,
                stale_result_id = %stale.result_id(),
                "call handle reused while still pending; stale slot dropped"
            );
        }
        debug!(call = %handle, result_id = %T::ID, "registered pending call");
        task
    }

    /// Remove and return the slot for `handle`. At most one caller ever gets it.
    pub fn take(&self, handle: CallHandle) -> Option<SlotRef> {
        let slot = self.pending.lock().remove(&handle);
        if slot.is_none() {
            warn!(call = %handle, "completion for unknown call handle; dropped");
        }
        slot
    }

    pub fn contains(&self, handle: CallHandle) -> bool {
        self.pending.lock().contains_key(&handle)
    }

    /// Number of calls still waiting for completion.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
