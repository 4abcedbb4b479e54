//! Simulated native service thread: posts interface callbacks and completes outstanding
//! requests on the loopback queue, concurrently with the pump.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relaybind_core::protocol::{
    Availability, AuthenticationStatus, LobbyCreated, NetworkingIdentity, RelayNetworkStatus,
    SessionRequest,
};
use relaybind_core::{CallHandle, CallbackId, LoopbackNative, PipeHandle};
use tokio::sync::watch;
use tracing::{debug, info};

/// An identifier no interface of this binding claims.
const FUTURE_CALLBACK: CallbackId = CallbackId(4_611);

pub struct NativeService {
    native: Arc<LoopbackNative>,
    pipe: PipeHandle,
    outstanding: Mutex<Vec<CallHandle>>,
    failure_every: u32,
}

impl NativeService {
    pub fn new(native: Arc<LoopbackNative>, pipe: PipeHandle, failure_every: u32) -> Self {
        Self {
            native,
            pipe,
            outstanding: Mutex::new(Vec::new()),
            failure_every,
        }
    }

    /// Start a lobby creation request. Completed on a later service tick.
    pub fn create_lobby(&self) -> CallHandle {
        let call = self.native.issue_call(self.pipe);
        if call.is_valid() {
            self.outstanding.lock().push(call);
        }
        call
    }

    /// One service step: complete outstanding calls and post interface traffic.
    pub fn step(&self, tick: u64) {
        let calls = std::mem::take(&mut *self.outstanding.lock());
        for (i, call) in calls.into_iter().enumerate() {
            let n = tick as u32 + i as u32 + 1;
            let failed = self.failure_every != 0 && n % self.failure_every == 0;
            let result = LobbyCreated {
                result: if failed { 2 } else { 1 },
                _pad: 0,
                lobby_id: 0x0186_0000_0000_0000 | call.0,
            };
            debug!(%call, failed, "service completing call");
            self.native.complete_call(self.pipe, call, &result, failed);
        }

        match tick % 4 {
            0 => {
                let avail = if tick % 8 == 0 {
                    Availability::Attempting
                } else {
                    Availability::Current
                };
                self.native
                    .push_callback(self.pipe, &RelayNetworkStatus::new(avail, "relay config refreshed"));
            }
            1 => self.native.push_callback(
                self.pipe,
                &AuthenticationStatus::new(Availability::Current, "cert valid"),
            ),
            2 => self.native.push_callback(
                self.pipe,
                &SessionRequest {
                    identity_remote: NetworkingIdentity::from_steam_id(76561197960265728 + tick),
                },
            ),
            _ => self.native.push_raw(self.pipe, FUTURE_CALLBACK, &tick.to_le_bytes()),
        }
    }
}

/// Drive `service` every `interval` until `stop` flips.
pub async fn run(service: Arc<NativeService>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                service.step(tick);
                tick += 1;
            }
            _ = stop.changed() => break,
        }
    }
    info!(ticks = tick, "native service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybind_core::PipeSession;

    #[test]
    fn step_completes_outstanding_calls_and_posts_traffic() {
        let native = Arc::new(LoopbackNative::new());
        let pipe = native.create_pipe();
        let session = PipeSession::new(native.clone(), pipe);
        let service = NativeService::new(native.clone(), pipe, 2);

        let a = session.issue::<LobbyCreated, _>(|| service.create_lobby()).unwrap();
        let b = session.issue::<LobbyCreated, _>(|| service.create_lobby()).unwrap();
        service.step(0);
        // Two completions plus one relay status.
        assert_eq!(native.queued(pipe), 3);

        let stats = session.run_callbacks();
        assert_eq!(stats.completions, 2);
        assert_eq!(stats.delivered, 1);
        // n = 1 succeeds, n = 2 fails.
        assert!(a.get_result().is_some());
        assert!(b.is_completed() && b.get_result().is_none());
    }

    #[test]
    fn future_callback_is_skipped_by_the_pump() {
        let native = Arc::new(LoopbackNative::new());
        let pipe = native.create_pipe();
        let session = PipeSession::new(native.clone(), pipe);
        let service = NativeService::new(native.clone(), pipe, 0);
        service.step(3);
        let stats = session.run_callbacks();
        assert_eq!(stats.unknown, 1);
        assert_eq!(native.counters(pipe).releases, 1);
    }
}
