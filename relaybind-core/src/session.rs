//! Per-pipe session: owns the registry, interface handlers and dispatcher for one pipe.
//! Handed around explicitly; there is no process-wide "active instance".

use std::sync::Arc;

use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, PumpStats};
use crate::handler::{NetworkingMessages, NetworkingSockets, NetworkingUtils};
use crate::native::{CallHandle, NativeQueue, PipeHandle};
use crate::record::CallbackRecord;
use crate::registry::CallResultRegistry;
use crate::slot::CallTask;

pub struct PipeSession {
    dispatcher: Dispatcher,
    registry: Arc<CallResultRegistry>,
    sockets: Arc<NetworkingSockets>,
    messages: Arc<NetworkingMessages>,
    utils: Arc<NetworkingUtils>,
}

impl PipeSession {
    pub fn new(native: Arc<dyn NativeQueue>, pipe: PipeHandle) -> Self {
        let registry = Arc::new(CallResultRegistry::new());
        let sockets = Arc::new(NetworkingSockets::default());
        let messages = Arc::new(NetworkingMessages::default());
        let utils = Arc::new(NetworkingUtils::default());

        let mut dispatcher = Dispatcher::new(native, pipe, registry.clone());
        dispatcher.add_interface(sockets.clone());
        dispatcher.add_interface(messages.clone());
        dispatcher.add_interface(utils.clone());
        debug!(%pipe, "session opened");

        Self {
            dispatcher,
            registry,
            sockets,
            messages,
            utils,
        }
    }

    pub fn pipe(&self) -> PipeHandle {
        self.dispatcher.pipe()
    }

    pub fn sockets(&self) -> &NetworkingSockets {
        &self.sockets
    }

    pub fn messages(&self) -> &NetworkingMessages {
        &self.messages
    }

    pub fn utils(&self) -> &NetworkingUtils {
        &self.utils
    }

    pub fn registry(&self) -> &CallResultRegistry {
        &self.registry
    }

    /// Issue an asynchronous native request and register its result slot atomically.
    /// `None` means the request never started.
    pub fn issue<T, F>(&self, start: F) -> Option<CallTask<T>>
    where
        T: CallbackRecord,
        F: FnOnce() -> CallHandle,
    {
        self.registry.issue(start)
    }

    /// One dispatcher pump on this pipe.
    pub fn run_callbacks(&self) -> PumpStats {
        self.dispatcher.run_callbacks()
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        let pending = self.registry.len();
        if pending > 0 {
            warn!(pipe = %self.pipe(), pending, "session closed with calls still pending");
        } else {
            debug!(pipe = %self.pipe(), "session closed");
        }
    }
}
