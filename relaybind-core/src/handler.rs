//! Per-interface handlers: identifier -> typed record -> subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::protocol::{
    AuthenticationStatus, IdRange, RelayNetworkStatus, SessionRequest, AUTHENTICATION_STATUS,
    MESSAGES_SESSION_REQUEST, NETWORKING_MESSAGES_RANGE, NETWORKING_SOCKETS_RANGE,
    NETWORKING_UTILS_RANGE, RELAY_NETWORK_STATUS,
};
use crate::record::{CallbackRecord, RawRecord};

/// Receives a typed notification by reference. Must not retain the reference.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscribers for one notification type.
pub struct EventChannel<T> {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: CallbackRecord> EventChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Reinterpret `record` as `T` and invoke every subscriber with it.
    /// Returns the number of subscribers invoked.
    pub(crate) fn deliver(&self, record: &RawRecord<'_>) -> usize {
        let Some(event) = record.view::<T>() else {
            return 0;
        };
        // Snapshot so subscribers can (un)subscribe from inside the callback.
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in &subscribers {
            subscriber(event);
        }
        subscribers.len()
    }
}

/// What a handler did with a record in its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Recognized; this many subscribers were invoked.
    Delivered(usize),
    /// In range but not known to this binding (newer native library).
    Unhandled,
}

/// Handler for one logical native interface's identifier sub-range.
pub trait InterfaceHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn range(&self) -> IdRange;

    fn handle(&self, record: &RawRecord<'_>) -> Delivery;
}

fn unhandled(interface: &'static str, record: &RawRecord<'_>) -> Delivery {
    warn!(
        interface,
        id = %record.id(),
        len = record.len(),
        "unrecognized callback in interface range; skipped"
    );
    Delivery::Unhandled
}

fn delivered(interface: &'static str, record: &RawRecord<'_>, n: usize) -> Delivery {
    debug!(interface, id = %record.id(), subscribers = n, "callback delivered");
    Delivery::Delivered(n)
}

/// Networking utils surface: relay network status.
#[derive(Default)]
pub struct NetworkingUtils {
    pub relay_network_status: EventChannel<RelayNetworkStatus>,
}

impl InterfaceHandler for NetworkingUtils {
    fn name(&self) -> &'static str {
        "networking_utils"
    }

    fn range(&self) -> IdRange {
        NETWORKING_UTILS_RANGE
    }

    fn handle(&self, record: &RawRecord<'_>) -> Delivery {
        match record.id() {
            RELAY_NETWORK_STATUS => {
                delivered(self.name(), record, self.relay_network_status.deliver(record))
            }
            _ => unhandled(self.name(), record),
        }
    }
}

/// Networking messages surface: inbound session requests.
#[derive(Default)]
pub struct NetworkingMessages {
    pub session_request: EventChannel<SessionRequest>,
}

impl InterfaceHandler for NetworkingMessages {
    fn name(&self) -> &'static str {
        "networking_messages"
    }

    fn range(&self) -> IdRange {
        NETWORKING_MESSAGES_RANGE
    }

    fn handle(&self, record: &RawRecord<'_>) -> Delivery {
        match record.id() {
            MESSAGES_SESSION_REQUEST => {
                delivered(self.name(), record, self.session_request.deliver(record))
            }
            _ => unhandled(self.name(), record),
        }
    }
}

/// Networking sockets surface: local authentication status.
#[derive(Default)]
pub struct NetworkingSockets {
    pub authentication_status: EventChannel<AuthenticationStatus>,
}

impl InterfaceHandler for NetworkingSockets {
    fn name(&self) -> &'static str {
        "networking_sockets"
    }

    fn range(&self) -> IdRange {
        NETWORKING_SOCKETS_RANGE
    }

    fn handle(&self, record: &RawRecord<'_>) -> Delivery {
        match record.id() {
            AUTHENTICATION_STATUS => {
                delivered(self.name(), record, self.authentication_status.deliver(record))
            }
            _ => unhandled(self.name(), record),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::protocol::{Availability, CallbackId, NetworkingIdentity};

    fn aligned<T: CallbackRecord>(value: &T) -> Vec<u64> {
        let bytes = value.as_bytes();
        let mut words = vec![0u64; bytes.len().div_ceil(8)];
        for (i, chunk) in bytes.chunks(8).enumerate() {
            let mut w = [0u8; 8];
            w[..chunk.len()].copy_from_slice(chunk);
            words[i] = u64::from_ne_bytes(w);
        }
        words
    }

    fn record_of<T: CallbackRecord>(words: &[u64]) -> RawRecord<'_> {
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, T::SIZE) };
        RawRecord::from_bytes(0, T::ID, bytes)
    }

    #[test]
    fn every_subscriber_sees_the_typed_record() {
        let utils = NetworkingUtils::default();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            utils.relay_network_status.subscribe(move |status| {
                assert_eq!(status.availability(), Availability::Current);
                assert_eq!(status.debug_msg(), "relays ok");
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        let words = aligned(&RelayNetworkStatus::new(Availability::Current, "relays ok"));
        let record = record_of::<RelayNetworkStatus>(&words);
        assert_eq!(utils.handle(&record), Delivery::Delivered(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribed_callback_is_not_invoked() {
        let messages = NetworkingMessages::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        let id = messages.session_request.subscribe(move |req| {
            assert_eq!(req.identity_remote.steam_id(), Some(7));
            hits_in.fetch_add(1, Ordering::SeqCst);
        });
        let words = aligned(&SessionRequest {
            identity_remote: NetworkingIdentity::from_steam_id(7),
        });
        let record = record_of::<SessionRequest>(&words);
        assert_eq!(messages.handle(&record), Delivery::Delivered(1));
        assert!(messages.session_request.unsubscribe(id));
        assert!(!messages.session_request.unsubscribe(id));
        assert_eq!(messages.handle(&record), Delivery::Delivered(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_subscribe_during_delivery() {
        let sockets = Arc::new(NetworkingSockets::default());
        let inner = sockets.clone();
        sockets.authentication_status.subscribe(move |_| {
            inner.authentication_status.subscribe(|_| {});
        });
        let words = aligned(&AuthenticationStatus::new(Availability::Attempting, ""));
        let record = record_of::<AuthenticationStatus>(&words);
        assert_eq!(sockets.handle(&record), Delivery::Delivered(1));
        assert_eq!(sockets.authentication_status.subscriber_count(), 2);
    }

    #[test]
    fn unknown_identifier_in_range_is_unhandled() {
        let utils = NetworkingUtils::default();
        let record = RawRecord::from_bytes(0, CallbackId(NETWORKING_UTILS_RANGE.start + 9), &[1, 2]);
        assert_eq!(utils.handle(&record), Delivery::Unhandled);
    }
}
