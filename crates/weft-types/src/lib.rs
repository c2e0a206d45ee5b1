//! # weft-types: Core types for `Weft`
//!
//! This crate contains the identities shared by every layer of the server:
//! - Socket identities ([`SocketHandle`], [`ConnectionHandle`], [`ListenerHandle`])
//! - Application session identity ([`SessionId`])
//! - Opaque dispatch context bound to a socket ([`EventContext`])
//! - Why a connection ended ([`CloseReason`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Socket handles - Copy (generation-checked arena keys)
// ============================================================================

/// Opaque identity of one socket owned by a reactor.
///
/// **Bit Layout**:
/// - Upper 32 bits: `generation` of the arena slot
/// - Lower 32 bits: `index` of the arena slot
///
/// A slot's generation is bumped every time the socket in it is removed, so a
/// handle that outlived its socket never matches the socket that later reuses
/// the slot.
///
/// # Examples
///
/// ```
/// # use weft_types::SocketHandle;
/// let handle = SocketHandle::new(7, 3);
/// assert_eq!(u64::from(handle), (3 << 32) | 7);
/// assert_eq!(handle.index(), 7);
/// assert_eq!(handle.generation(), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SocketHandle(u64);

/// Handle of an accepted connection socket.
pub type ConnectionHandle = SocketHandle;

/// Handle of a listening socket.
pub type ListenerHandle = SocketHandle;

impl SocketHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    /// Slot index (lower 32 bits).
    pub fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Slot generation (upper 32 bits).
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.index(), self.generation())
    }
}

impl From<u64> for SocketHandle {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SocketHandle> for u64 {
    fn from(handle: SocketHandle) -> Self {
        handle.0
    }
}

// ============================================================================
// Session and dispatch identities
// ============================================================================

/// Application-level session identity assigned by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SessionId> for u64 {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Opaque value bound to a socket and echoed back in every event for it.
///
/// The reactor never interprets it. The server binds each connection's own
/// handle so events can be routed without a second lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventContext(u64);

impl EventContext {
    pub const NONE: EventContext = EventContext(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<SocketHandle> for EventContext {
    fn from(handle: SocketHandle) -> Self {
        Self(handle.0)
    }
}

// ============================================================================
// Close reasons - Copy (simple enum reported once per connection)
// ============================================================================

/// Why a connection ended.
///
/// Every closed connection reports exactly one of these to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The user asked to leave.
    UserQuit,
    /// Idle, handshake, or negotiation deadline passed.
    Timeout,
    /// The socket failed or the peer went away.
    NetworkError,
    /// The peer violated the line protocol.
    ProtocolError,
    /// The TLS session failed.
    TlsError,
    /// The server is stopping.
    ServerShutdown,
    /// An operator disconnected the session.
    AdminAction,
    /// The server was at its connection limit.
    Capacity,
    /// The session layer refused the connection.
    LoginFailure,
    Unknown,
}

impl CloseReason {
    /// All reasons, in declaration order.
    pub const ALL: [CloseReason; 10] = [
        Self::UserQuit,
        Self::Timeout,
        Self::NetworkError,
        Self::ProtocolError,
        Self::TlsError,
        Self::ServerShutdown,
        Self::AdminAction,
        Self::Capacity,
        Self::LoginFailure,
        Self::Unknown,
    ];

    /// Stable lowercase label, used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserQuit => "user_quit",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::ProtocolError => "protocol_error",
            Self::TlsError => "tls_error",
            Self::ServerShutdown => "server_shutdown",
            Self::AdminAction => "admin_action",
            Self::Capacity => "capacity",
            Self::LoginFailure => "login_failure",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
