//! Callback dispatch and asynchronous call-result correlation for a poll-based native
//! networking library. Host-driven: the host owns the thread and calls the pump.

pub mod dispatch;
pub mod ffi;
pub mod handler;
pub mod loopback;
pub mod native;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod session;
pub mod slot;

pub use dispatch::{Dispatcher, PumpStats};
pub use handler::{
    Delivery, EventChannel, InterfaceHandler, NetworkingMessages, NetworkingSockets,
    NetworkingUtils, SubscriptionId,
};
pub use loopback::{LoopbackCounters, LoopbackNative};
pub use native::{CallHandle, FetchOutcome, NativeQueue, PipeHandle, PoppedRecord};
pub use protocol::{CallbackId, IdRange};
pub use record::{CallbackRecord, RawRecord, RecordMismatch};
pub use registry::CallResultRegistry;
pub use session::PipeSession;
pub use slot::{CallTask, PendingCall, SlotRef};
