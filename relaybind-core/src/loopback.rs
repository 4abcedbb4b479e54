//! In-process native layer: a software callback queue per pipe plus a call-result store.
//! Producer methods may be called from any thread while another thread pumps.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::native::{CallHandle, FetchOutcome, NativeQueue, PipeHandle};
use crate::protocol::{CallCompleted, CallbackId};
use crate::record::{CallbackRecord, RawRecord};

/// Payload bytes in 8-byte aligned heap storage, so typed views over it are aligned.
struct Payload {
    words: Box<[u64]>,
    len: usize,
}

impl Payload {
    fn new(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8)].into_boxed_slice();
        for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
            let mut w = [0u8; 8];
            w[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(w);
        }
        Self {
            words,
            len: bytes.len(),
        }
    }

    fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    fn to_vec(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|w| w.to_ne_bytes())
            .take(self.len)
            .collect()
    }
}

struct QueuedRecord {
    id: CallbackId,
    payload: Payload,
}

struct StoredResult {
    id: CallbackId,
    bytes: Vec<u8>,
    failed: bool,
}

/// Native call counts for one pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackCounters {
    pub frames: u64,
    pub pops: u64,
    pub releases: u64,
    pub fetches: u64,
}

#[derive(Default)]
struct PipeQueue {
    queue: VecDeque<QueuedRecord>,
    /// Popped and not yet released; its heap payload backs the outstanding `RawRecord`.
    current: Option<QueuedRecord>,
    results: HashMap<CallHandle, StoredResult>,
    counters: LoopbackCounters,
}

pub struct LoopbackNative {
    pipes: Mutex<HashMap<PipeHandle, PipeQueue>>,
    next_pipe: AtomicI32,
    next_call: AtomicU64,
}

impl Default for LoopbackNative {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNative {
    pub fn new() -> Self {
        Self {
            pipes: Mutex::new(HashMap::new()),
            next_pipe: AtomicI32::new(1),
            next_call: AtomicU64::new(1),
        }
    }

    pub fn create_pipe(&self) -> PipeHandle {
        let pipe = PipeHandle(self.next_pipe.fetch_add(1, Ordering::Relaxed));
        self.pipes.lock().insert(pipe, PipeQueue::default());
        pipe
    }

    /// Start an asynchronous request on `pipe`. Returns the invalid handle for an unknown pipe.
    pub fn issue_call(&self, pipe: PipeHandle) -> CallHandle {
        if !self.pipes.lock().contains_key(&pipe) {
            warn!(%pipe, "request issued on unknown pipe");
            return CallHandle::INVALID;
        }
        CallHandle(self.next_call.fetch_add(1, Ordering::Relaxed))
    }

    pub fn push_callback<T: CallbackRecord>(&self, pipe: PipeHandle, record: &T) {
        self.push_raw(pipe, T::ID, record.as_bytes());
    }

    pub fn push_raw(&self, pipe: PipeHandle, id: CallbackId, bytes: &[u8]) {
        let mut pipes = self.pipes.lock();
        let Some(q) = pipes.get_mut(&pipe) else {
            warn!(%pipe, %id, "callback posted to unknown pipe; dropped");
            return;
        };
        q.queue.push_back(QueuedRecord {
            id,
            payload: Payload::new(bytes),
        });
    }

    /// Store `result` for `call` and post the call-completed notification for it.
    pub fn complete_call<T: CallbackRecord>(
        &self,
        pipe: PipeHandle,
        call: CallHandle,
        result: &T,
        failed: bool,
    ) {
        {
            let mut pipes = self.pipes.lock();
            let Some(q) = pipes.get_mut(&pipe) else {
                warn!(%pipe, %call, "completion for unknown pipe; dropped");
                return;
            };
            q.results.insert(
                call,
                StoredResult {
                    id: T::ID,
                    bytes: result.as_bytes().to_vec(),
                    failed,
                },
            );
        }
        self.push_callback(pipe, &CallCompleted::new(call, T::ID, T::SIZE));
    }

    /// Records waiting on `pipe`, not counting one popped and unreleased.
    pub fn queued(&self, pipe: PipeHandle) -> usize {
        self.pipes.lock().get(&pipe).map_or(0, |q| q.queue.len())
    }

    pub fn counters(&self, pipe: PipeHandle) -> LoopbackCounters {
        self.pipes
            .lock()
            .get(&pipe)
            .map(|q| q.counters)
            .unwrap_or_default()
    }

    /// Copy of the payload currently popped on `pipe`, if any.
    pub fn current_payload(&self, pipe: PipeHandle) -> Option<Vec<u8>> {
        self.pipes
            .lock()
            .get(&pipe)
            .and_then(|q| q.current.as_ref().map(|r| r.payload.to_vec()))
    }
}

// SAFETY: a popped payload stays in `current` until `release_record`, and a second pop on
// the same pipe is refused while `current` is occupied.
unsafe impl NativeQueue for LoopbackNative {
    fn advance_frame(&self, pipe: PipeHandle) {
        if let Some(q) = self.pipes.lock().get_mut(&pipe) {
            q.counters.frames += 1;
        }
    }

    fn pop_next_record(&self, pipe: PipeHandle) -> Option<RawRecord<'_>> {
        let mut pipes = self.pipes.lock();
        let q = pipes.get_mut(&pipe)?;
        if q.current.is_some() {
            error!(%pipe, "pop before the previous record was released");
            return None;
        }
        let next = q.queue.pop_front()?;
        q.counters.pops += 1;
        let (id, data, len) = (next.id, next.payload.as_ptr(), next.payload.len);
        q.current = Some(next);
        // SAFETY: the boxed payload does not move while it sits in `current`, and pipes are
        // never removed. It is freed only by `release_record`, whose caller guarantees the
        // record is gone by then.
        Some(unsafe { RawRecord::from_raw_parts(pipe.0, id, data, len) })
    }

    unsafe fn release_record(&self, pipe: PipeHandle) {
        let mut pipes = self.pipes.lock();
        let Some(q) = pipes.get_mut(&pipe) else {
            return;
        };
        q.counters.releases += 1;
        if q.current.take().is_none() {
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
        let mut pipes = self.pipes.lock();
        let Some(q) = pipes.get_mut(&pipe) else {
            return FetchOutcome::default();
        };
        q.counters.fetches += 1;
        let Some(stored) = q.results.remove(&handle) else {
            return FetchOutcome::default();
        };
        if stored.id != expected || stored.bytes.len() != out.len() {
            warn!(
                %pipe,
                call = %handle,
                stored_id = %stored.id,
                %expected,
                "call result type mismatch"
            );
            return FetchOutcome::default();
        }
        out.copy_from_slice(&stored.bytes);
        FetchOutcome {
            found: true,
            failed: stored.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::PoppedRecord;
    use crate::protocol::{Availability, FileSignatureChecked, LobbyCreated, RelayNetworkStatus};

    #[test]
    fn pop_release_cycle_is_fifo() {
        let native = LoopbackNative::new();
        let pipe = native.create_pipe();
        native.push_raw(pipe, CallbackId(1), &[1, 2, 3]);
        native.push_raw(pipe, CallbackId(2), &[]);

        let first = PoppedRecord::pop(&native, pipe).unwrap();
        assert_eq!(first.id(), CallbackId(1));
        assert_eq!(first.payload(), &[1, 2, 3]);
        assert_eq!(native.current_payload(pipe), Some(vec![1, 2, 3]));
        // Second pop without release is refused.
        assert!(PoppedRecord::pop(&native, pipe).is_none());
        drop(first);
        assert_eq!(native.current_payload(pipe), None);

        let second = PoppedRecord::pop(&native, pipe).unwrap();
        assert_eq!(second.id(), CallbackId(2));
        assert!(second.is_empty());
        drop(second);
        assert!(PoppedRecord::pop(&native, pipe).is_none());
        assert_eq!(
            native.counters(pipe),
            LoopbackCounters {
                frames: 0,
                pops: 2,
                releases: 2,
                fetches: 0
            }
        );
    }

    #[test]
    fn payloads_are_aligned_for_typed_views() {
        let native = LoopbackNative::new();
        let pipe = native.create_pipe();
        let call = CallCompleted::new(CallHandle(3), LobbyCreated::ID, LobbyCreated::SIZE);
        native.push_callback(pipe, &call);
        let record = PoppedRecord::pop(&native, pipe).unwrap();
        assert_eq!(record.try_view::<CallCompleted>().unwrap(), &call);
    }

    #[test]
    fn next_record_is_read_only_after_the_previous_is_released() {
        let native = LoopbackNative::new();
        let pipe = native.create_pipe();
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, "first"));
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Failed, "second"));

        let first = PoppedRecord::pop(&native, pipe).unwrap();
        let status = *first.view::<RelayNetworkStatus>().unwrap();
        drop(first);
        let second = PoppedRecord::pop(&native, pipe).unwrap();
        let next = second.view::<RelayNetworkStatus>().unwrap();

        // A copied-out record keeps its values after the native payload is freed.
        assert_eq!(status.availability(), Availability::Current);
        assert_eq!(status.debug_msg(), "first");
        assert_eq!(next.availability(), Availability::Failed);
        assert_eq!(next.debug_msg(), "second");
        drop(second);
        assert_eq!(native.counters(pipe).releases, 2);
    }

    #[test]
    fn fetch_checks_identifier_and_size() {
        let native = LoopbackNative::new();
        let pipe = native.create_pipe();
        let call = native.issue_call(pipe);
        native.complete_call(pipe, call, &FileSignatureChecked { check_result: 2 }, false);

        let mut wrong = [0u8; 16];
        let outcome = native.fetch_call_result(pipe, call, &mut wrong, LobbyCreated::ID);
        assert!(!outcome.found);

        let call = native.issue_call(pipe);
        native.complete_call(pipe, call, &FileSignatureChecked { check_result: 2 }, true);
        let mut out = [0u8; 4];
        let outcome = native.fetch_call_result(pipe, call, &mut out, FileSignatureChecked::ID);
        assert_eq!(
            outcome,
            FetchOutcome {
                found: true,
                failed: true
            }
        );
        assert_eq!(native.queued(pipe), 2);
    }

    #[test]
    fn unknown_pipe_yields_invalid_handle() {
        let native = LoopbackNative::new();
        assert_eq!(native.issue_call(PipeHandle(77)), CallHandle::INVALID);
    }
}
