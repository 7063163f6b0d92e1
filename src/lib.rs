//! Sessionwire - authenticated, encrypted, resumable session transport.
//!
//! A client authenticates once with a pluggable key agreement, then issues
//! correlated calls over pooled HTTP connections or a shared WebSocket. Every
//! message travels as a record whose body is encrypted and MAC'd under
//! per-direction cipher states.
//!
//! # Architecture
//!
//! - **Record layer** - content-type framing and the cipher-state machine
//! - **Handshake** - SRP, ECDHE, static-key and ticket-resume strategies
//! - **Tickets** - single-use resumption credentials with expiry
//! - **Channels** - per-server HTTP slot pool and WebSocket demultiplexer
//! - **Session** - the facade tying the above together
//!
//! # Modules
//!
//! - [`record`] - records, cipher states, `RecordLayer`
//! - [`handshake`] - key-agreement strategies and handshake messages
//! - [`tickets`] - `SessionTicketPool`
//! - [`channel`] - transports, `ChannelPool`, `ChannelRegistry`, `WsDemux`
//! - [`correlator`] - request/response matching
//! - [`session`] - `SessionManager` and `Session`
//! - [`config`] - configuration loading

pub mod channel;
pub mod correlator;
pub mod handshake;
pub mod record;
pub mod session;
pub mod tickets;
pub mod ws;

pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;

// Re-export commonly used types
pub use channel::{ChannelRegistry, ServerKey, TransportFactory};
pub use config::ClientConfig;
pub use crypto::{CryptoService, DefaultCryptoService};
pub use error::{Result, SessionError, TransportError};
pub use handshake::Strategy;
pub use session::{
    CallChannel, CallOptions, ProbeResult, Session, SessionEvent, SessionManager, SessionOptions,
};
