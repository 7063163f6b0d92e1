//! Error taxonomy for the session layer.
//!
//! Errors fall into five families:
//!
//! - **Protocol** - bad content type, MAC or sequence mismatch, malformed
//!   encoding, fatal alerts. Fatal to the session, never retried.
//! - **Authentication** - degenerate SRP values, proof mismatch, handshake
//!   methods called out of order. Fatal to the handshake attempt only.
//! - **Resource exhaustion** - no tickets and no refill hook, no pooled slot
//!   after being woken. Retryable.
//! - **Transport** - see [`TransportError`]. Retryable at the caller's discretion.
//! - **Cancellation** - an explicit outcome, distinguishable from failures.

use std::fmt;

/// Failures of the physical HTTP/WebSocket transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request was sent but no response arrived (timeout, reset mid-flight).
    NoResponse(String),
    /// The server answered with a non-success HTTP status.
    InvalidStatus {
        /// HTTP status code returned by the server.
        status: u16,
    },
    /// Network-level failure (DNS, connect refused, TLS).
    Network(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoResponse(msg) => write!(f, "No response received: {msg}"),
            Self::InvalidStatus { status } => write!(f, "Invalid HTTP status: {status}"),
            Self::Network(msg) => write!(f, "Network error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors that can occur during session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Record framing violation: bad content type, MAC/sequence mismatch,
    /// malformed record, exhausted sequence counter.
    Protocol(String),
    /// The peer sent a fatal alert.
    Alert(String),
    /// Key agreement failed (degenerate public value, proof mismatch).
    Auth(String),
    /// A handshake or session method was called out of order.
    InvalidState(String),
    /// The ticket pool is empty and no refill hook is registered.
    NoTickets,
    /// No pooled channel slot was available after being woken.
    ChannelAcquisition,
    /// Physical transport failure.
    Transport(TransportError),
    /// The call was cancelled through its cancellation token.
    Cancelled,
    /// The session or channel was torn down while the call was pending.
    ConnectionClosed,
    /// The call did not complete within its timeout.
    Timeout,
    /// The server answered the call with an application error.
    Remote {
        /// Server-defined error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
    /// A cryptographic primitive rejected its input.
    Crypto(String),
    /// Encoding or decoding of a structured value failed.
    Codec(String),
    /// Invalid client configuration or session options.
    Config(String),
}

impl SessionError {
    /// Returns `true` if the error tears the whole session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Alert(_) | Self::ConnectionClosed)
    }

    /// Returns `true` if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoTickets | Self::ChannelAcquisition | Self::Transport(_) | Self::Timeout
        )
    }

    /// Returns `true` if this is the explicit cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Alert(msg) => write!(f, "Fatal alert from peer: {msg}"),
            Self::Auth(msg) => write!(f, "Authentication failed: {msg}"),
            Self::InvalidState(msg) => write!(f, "Invalid state: {msg}"),
            Self::NoTickets => write!(f, "No session tickets available"),
            Self::ChannelAcquisition => write!(f, "Failed to acquire a pooled channel"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Remote { code, message } => write!(f, "Remote error {code}: {message}"),
            Self::Crypto(msg) => write!(f, "Crypto error: {msg}"),
            Self::Codec(msg) => write!(f, "Codec error: {msg}"),
            Self::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
