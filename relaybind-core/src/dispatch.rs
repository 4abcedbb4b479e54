//! Dispatcher pump: drain one pipe's native queue and route each record.
//!
//! Per pump: advance one frame, then pop records until the queue is empty. Each record is
//! classified by identifier (call completed, a registered interface's range, or unknown),
//! handled, and released exactly once. Records are handled strictly in queue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::handler::{Delivery, InterfaceHandler};
use crate::native::{NativeQueue, PipeHandle, PoppedRecord};
use crate::protocol::{CallCompleted, CallbackId, CALL_COMPLETED};
use crate::record::RawRecord;
use crate::registry::CallResultRegistry;

/// Counters for one pump invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Records popped (and released).
    pub records: usize,
    /// Call-completed notifications seen.
    pub completions: usize,
    /// Completions whose handle had no pending slot.
    pub stale_completions: usize,
    /// Records recognized by an interface handler.
    pub delivered: usize,
    /// Records inside an interface range that the handler did not recognize.
    pub unhandled: usize,
    /// Records outside every known range.
    pub unknown: usize,
}

impl PumpStats {
    /// Add another pump's counters to these.
    pub fn accumulate(&mut self, other: &PumpStats) {
        self.records += other.records;
        self.completions += other.completions;
        self.stale_completions += other.stale_completions;
        self.delivered += other.delivered;
        self.unhandled += other.unhandled;
        self.unknown += other.unknown;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    CallCompleted,
    Interface(usize),
    Unknown,
}

struct PumpFlag<'a>(&'a AtomicBool);

impl Drop for PumpFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Dispatcher {
    native: Arc<dyn NativeQueue>,
    pipe: PipeHandle,
    registry: Arc<CallResultRegistry>,
    interfaces: Vec<Arc<dyn InterfaceHandler>>,
    pumping: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        native: Arc<dyn NativeQueue>,
        pipe: PipeHandle,
        registry: Arc<CallResultRegistry>,
    ) -> Self {
        Self {
            native,
            pipe,
            registry,
            interfaces: Vec::new(),
            pumping: AtomicBool::new(false),
        }
    }

    /// Route records in `handler.range()` to `handler`. Ranges must not overlap.
    pub fn add_interface(&mut self, handler: Arc<dyn InterfaceHandler>) {
        let range = handler.range();
        debug_assert!(
            !range.contains(CALL_COMPLETED),
            "{} range swallows the call-completed identifier",
            handler.name()
        );
        debug_assert!(
            self.interfaces
                .iter()
                .all(|h| range.end <= h.range().start || h.range().end <= range.start),
            "{} range overlaps a registered interface",
            handler.name()
        );
        self.interfaces.push(handler);
    }

    pub fn pipe(&self) -> PipeHandle {
        self.pipe
    }

    pub fn registry(&self) -> &Arc<CallResultRegistry> {
        &self.registry
    }

    fn classify(&self, id: CallbackId) -> Route {
        if id == CALL_COMPLETED {
            return Route::CallCompleted;
        }
        self.interfaces
            .iter()
            .position(|h| h.range().contains(id))
            .map_or(Route::Unknown, Route::Interface)
    }

    /// Drain every record currently queued on this pipe. Runs on the calling thread; a
    /// reentrant or concurrent call for the same dispatcher is skipped.
    pub fn run_callbacks(&self) -> PumpStats {
        let mut stats = PumpStats::default();
        if self.pumping.swap(true, Ordering::Acquire) {
            warn!(pipe = %self.pipe, "pump already running on this pipe; skipped");
            return stats;
        }
        let _flag = PumpFlag(&self.pumping);

        self.native.advance_frame(self.pipe);
        while let Some(popped) = PoppedRecord::pop(&*self.native, self.pipe) {
            stats.records += 1;
            self.route(&popped, &mut stats);
        }
        if stats.records > 0 {
            debug!(pipe = %self.pipe, ?stats, "pump drained queue");
        }
        stats
    }

    fn route(&self, record: &RawRecord<'_>, stats: &mut PumpStats) {
        match self.classify(record.id()) {
            Route::CallCompleted => self.complete_call(record, stats),
            Route::Interface(i) => match self.interfaces[i].handle(record) {
                Delivery::Delivered(_) => stats.delivered += 1,
                Delivery::Unhandled => stats.unhandled += 1,
            },
            Route::Unknown => {
                stats.unknown += 1;
                debug!(
                    pipe = %self.pipe,
                    id = %record.id(),
                    len = record.len(),
                    owner = record.owner(),
                    "callback outside known interfaces; skipped"
                );
            }
        }
    }

    fn complete_call(&self, record: &RawRecord<'_>, stats: &mut PumpStats) {
        let Some(completion) = record.view::<CallCompleted>() else {
            return;
        };
        let completion = *completion;
        stats.completions += 1;
        match self.registry.take(completion.handle()) {
            Some(slot) => {
                debug!(
                    pipe = %self.pipe,
                    call = %completion.handle(),
                    result_id = %completion.result_id(),
                    "completing pending call"
                );
                slot.complete_from(&*self.native, self.pipe, &completion);
            }
            None => stats.stale_completions += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NetworkingUtils;
    use crate::loopback::LoopbackNative;
    use crate::native::CallHandle;
    use crate::protocol::{Availability, LobbyCreated, RelayNetworkStatus};
    use crate::record::CallbackRecord;

    fn setup() -> (Arc<LoopbackNative>, PipeHandle, Dispatcher, Arc<NetworkingUtils>) {
        let native = Arc::new(LoopbackNative::new());
        let pipe = native.create_pipe();
        let registry = Arc::new(CallResultRegistry::new());
        let mut dispatcher = Dispatcher::new(native.clone(), pipe, registry);
        let utils = Arc::new(NetworkingUtils::default());
        dispatcher.add_interface(utils.clone());
        (native, pipe, dispatcher, utils)
    }

    #[test]
    fn classification_prefers_call_completed() {
        let (_, _, dispatcher, _) = setup();
        assert_eq!(dispatcher.classify(CALL_COMPLETED), Route::CallCompleted);
        assert_eq!(
            dispatcher.classify(RelayNetworkStatus::ID),
            Route::Interface(0)
        );
        assert_eq!(dispatcher.classify(CallbackId(1)), Route::Unknown);
    }

    #[test]
    fn release_count_matches_pop_count_across_routes() {
        let (native, pipe, dispatcher, _) = setup();
        let task = dispatcher
            .registry()
            .issue::<LobbyCreated, _>(|| native.issue_call(pipe))
            .unwrap();
        native.complete_call(
            pipe,
            task.handle(),
            &LobbyCreated {
                result: 1,
                _pad: 0,
                lobby_id: 5,
            },
            false,
        );
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, ""));
        native.push_raw(pipe, CallbackId(4242), &[0u8; 12]);

        let stats = dispatcher.run_callbacks();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.completions, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.unknown, 1);
        let counters = native.counters(pipe);
        assert_eq!(counters.pops, 3);
        assert_eq!(counters.releases, counters.pops);
        assert_eq!(counters.frames, 1);
        assert_eq!(task.get_result().map(|r| r.lobby_id), Some(5));
    }

    #[test]
    fn reentrant_pump_is_skipped() {
        let (native, pipe, dispatcher, utils) = setup();
        let dispatcher = Arc::new(dispatcher);
        let inner = Arc::downgrade(&dispatcher);
        let nested = Arc::new(parking_lot::Mutex::new(None));
        let nested_in = nested.clone();
        utils.relay_network_status.subscribe(move |_| {
            if let Some(d) = inner.upgrade() {
                *nested_in.lock() = Some(d.run_callbacks());
            }
        });
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, ""));
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Failed, ""));

        let stats = dispatcher.run_callbacks();
        assert_eq!(stats.records, 2);
        assert_eq!(*nested.lock(), Some(PumpStats::default()));
        let counters = native.counters(pipe);
        assert_eq!(counters.pops, counters.releases);
        // The flag is cleared once the outer pump returns.
        assert_eq!(dispatcher.run_callbacks().records, 0);
    }

    #[test]
    fn record_is_released_when_a_subscriber_panics() {
        let (native, pipe, dispatcher, utils) = setup();
        utils
            .relay_network_status
            .subscribe(|_| panic!("subscriber failure"));
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, ""));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            dispatcher.run_callbacks();
        }));
        assert!(result.is_err());
        let counters = native.counters(pipe);
        assert_eq!(counters.pops, 1);
        assert_eq!(counters.releases, 1);
        // Pump is usable again afterwards.
        assert_eq!(dispatcher.run_callbacks(), PumpStats::default());
    }

    #[test]
    fn stale_completion_is_counted_and_released() {
        let (native, pipe, dispatcher, _) = setup();
        native.push_callback(
            pipe,
            &CallCompleted::new(CallHandle(99), LobbyCreated::ID, 16),
        );
        let stats = dispatcher.run_callbacks();
        assert_eq!(stats.completions, 1);
        assert_eq!(stats.stale_completions, 1);
        assert_eq!(native.counters(pipe).releases, 1);
    }

    #[test]
    fn stats_accumulate_across_pumps() {
        let (native, pipe, dispatcher, _) = setup();
        let mut totals = PumpStats::default();
        native.push_raw(pipe, CallbackId(1), &[]);
        totals.accumulate(&dispatcher.run_callbacks());
        native.push_callback(pipe, &RelayNetworkStatus::new(Availability::Current, ""));
        totals.accumulate(&dispatcher.run_callbacks());
        assert_eq!(totals.records, 2);
        assert_eq!((totals.unknown, totals.delivered), (1, 1));
    }
}
