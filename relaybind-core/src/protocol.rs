//! Callback identifiers, per-interface identifier ranges, and the typed records this binding
//! knows how to reinterpret. Layouts follow the native library's packing (no implicit padding).

use std::fmt;

use crate::native::CallHandle;
use crate::record::CallbackRecord;

/// Numeric type tag of a record within a callback queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub i32);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb{}", self.0)
    }
}

/// Half-open identifier range `[start, end)` reserved for one native interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: i32,
    pub end: i32,
}

impl IdRange {
    pub const fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        id.0 >= self.start && id.0 < self.end
    }
}

const UTILS_BASE: i32 = 700;
const MATCHMAKING_BASE: i32 = 500;
const NETWORKING_SOCKETS_BASE: i32 = 1220;
const NETWORKING_MESSAGES_BASE: i32 = 1250;
const NETWORKING_UTILS_BASE: i32 = 1280;

pub const NETWORKING_SOCKETS_RANGE: IdRange =
    IdRange::new(NETWORKING_SOCKETS_BASE, NETWORKING_MESSAGES_BASE);
pub const NETWORKING_MESSAGES_RANGE: IdRange =
    IdRange::new(NETWORKING_MESSAGES_BASE, NETWORKING_UTILS_BASE);
pub const NETWORKING_UTILS_RANGE: IdRange =
    IdRange::new(NETWORKING_UTILS_BASE, NETWORKING_UTILS_BASE + 30);

/// Reserved identifier of the generic "call completed" notification. Always recognized.
pub const CALL_COMPLETED: CallbackId = CallbackId(UTILS_BASE + 3);
pub const FILE_SIGNATURE_CHECKED: CallbackId = CallbackId(UTILS_BASE + 5);
pub const LOBBY_CREATED: CallbackId = CallbackId(MATCHMAKING_BASE + 13);
pub const AUTHENTICATION_STATUS: CallbackId = CallbackId(NETWORKING_SOCKETS_BASE + 2);
pub const MESSAGES_SESSION_REQUEST: CallbackId = CallbackId(NETWORKING_MESSAGES_BASE + 1);
pub const RELAY_NETWORK_STATUS: CallbackId = CallbackId(NETWORKING_UTILS_BASE + 1);

/// Availability of a networking facility, as reported by the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    CannotTry,
    Failed,
    Previously,
    Retrying,
    NeverTried,
    Waiting,
    Attempting,
    Current,
    Unknown(i32),
}

impl From<i32> for Availability {
    fn from(raw: i32) -> Self {
        match raw {
            -102 => Self::CannotTry,
            -101 => Self::Failed,
            -100 => Self::Previously,
            -10 => Self::Retrying,
            1 => Self::NeverTried,
            2 => Self::Waiting,
            3 => Self::Attempting,
            100 => Self::Current,
            other => Self::Unknown(other),
        }
    }
}

impl Availability {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::CannotTry => -102,
            Self::Failed => -101,
            Self::Previously => -100,
            Self::Retrying => -10,
            Self::NeverTried => 1,
            Self::Waiting => 2,
            Self::Attempting => 3,
            Self::Current => 100,
            Self::Unknown(raw) => raw,
        }
    }
}

fn debug_text(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn write_debug_text(dst: &mut [u8], msg: &str) {
    let n = msg.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&msg.as_bytes()[..n]);
    dst[n..].fill(0);
}

/// Generic completion of an asynchronous call: which call, and the real result's
/// identifier and byte size.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCompleted {
    pub call: u64,
    pub result_id: i32,
    pub result_size: u32,
}

unsafe impl CallbackRecord for CallCompleted {
    const ID: CallbackId = CALL_COMPLETED;
}

impl CallCompleted {
    /// A size beyond `u32` saturates, so it never matches a real result record.
    pub fn new(call: CallHandle, result_id: CallbackId, result_size: usize) -> Self {
        debug_assert!(
            u32::try_from(result_size).is_ok(),
            "call result size {result_size} does not fit the notification"
        );
        Self {
            call: call.0,
            result_id: result_id.0,
            result_size: u32::try_from(result_size).unwrap_or(u32::MAX),
        }
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle(self.call)
    }

    pub fn result_id(&self) -> CallbackId {
        CallbackId(self.result_id)
    }

    pub fn result_size(&self) -> usize {
        self.result_size as usize
    }
}

/// Relay network availability changed (networking utils interface).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayNetworkStatus {
    pub avail: i32,
    pub ping_measurement_in_progress: i32,
    pub avail_network_config: i32,
    pub avail_any_relay: i32,
    pub debug_msg: [u8; 256],
}

unsafe impl CallbackRecord for RelayNetworkStatus {
    const ID: CallbackId = RELAY_NETWORK_STATUS;
}

impl RelayNetworkStatus {
    pub fn new(avail: Availability, debug_msg: &str) -> Self {
        let mut status = Self {
            avail: avail.as_raw(),
            ping_measurement_in_progress: 0,
            avail_network_config: avail.as_raw(),
            avail_any_relay: avail.as_raw(),
            debug_msg: [0; 256],
        };
        write_debug_text(&mut status.debug_msg, debug_msg);
        status
    }

    pub fn availability(&self) -> Availability {
        Availability::from(self.avail)
    }

    pub fn debug_msg(&self) -> &str {
        debug_text(&self.debug_msg)
    }
}

/// Authentication status of the local host changed (networking sockets interface).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationStatus {
    pub avail: i32,
    pub debug_msg: [u8; 256],
}

unsafe impl CallbackRecord for AuthenticationStatus {
    const ID: CallbackId = AUTHENTICATION_STATUS;
}

impl AuthenticationStatus {
    pub fn new(avail: Availability, debug_msg: &str) -> Self {
        let mut status = Self {
            avail: avail.as_raw(),
            debug_msg: [0; 256],
        };
        write_debug_text(&mut status.debug_msg, debug_msg);
        status
    }

    pub fn availability(&self) -> Availability {
        Availability::from(self.avail)
    }

    pub fn debug_msg(&self) -> &str {
        debug_text(&self.debug_msg)
    }
}

/// Identity of a remote peer: kind tag, payload size, and up to 128 bytes of payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkingIdentity {
    pub kind: i32,
    pub size: i32,
    pub data: [u8; 128],
}

impl NetworkingIdentity {
    pub const KIND_STEAM_ID: i32 = 16;

    pub fn from_steam_id(id: u64) -> Self {
        let mut data = [0u8; 128];
        data[..8].copy_from_slice(&id.to_le_bytes());
        Self {
            kind: Self::KIND_STEAM_ID,
            size: 8,
            data,
        }
    }

    pub fn steam_id(&self) -> Option<u64> {
        if self.kind != Self::KIND_STEAM_ID || self.size != 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[..8]);
        Some(u64::from_le_bytes(raw))
    }
}

/// A remote peer wants to open a messaging session (networking messages interface).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub identity_remote: NetworkingIdentity,
}

unsafe impl CallbackRecord for SessionRequest {
    const ID: CallbackId = MESSAGES_SESSION_REQUEST;
}

/// Call result: a lobby was created. 16 bytes: result code, explicit pad, lobby id.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyCreated {
    pub result: i32,
    pub _pad: u32,
    pub lobby_id: u64,
}

unsafe impl CallbackRecord for LobbyCreated {
    const ID: CallbackId = LOBBY_CREATED;
}

/// Call result: outcome of a file signature check.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignatureChecked {
    pub check_result: i32,
}

unsafe impl CallbackRecord for FileSignatureChecked {
    const ID: CallbackId = FILE_SIGNATURE_CHECKED;
}
