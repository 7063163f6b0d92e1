//! Protocol and transport constants.
//!
//! This module centralizes all magic numbers used by the session layer.
//! Constants are grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Record layer**: Content type bytes, key and tag sizes
//! - **Pooling**: Physical channel limits
//! - **Tickets**: Expiry margins and replenishment thresholds
//! - **Timeouts**: Network and operation timeouts

use std::time::Duration;

// ============================================================================
// Record layer
// ============================================================================

/// Content type byte for ChangeCipherSpec records.
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;

/// Content type byte for Alert records.
pub const CONTENT_ALERT: u8 = 21;

/// Content type byte for Handshake records.
pub const CONTENT_HANDSHAKE: u8 = 22;

/// Content type byte for ApplicationData records.
pub const CONTENT_APPLICATION_DATA: u8 = 23;

/// AES-256 key length.
pub const KEY_SIZE: usize = 32;

/// HMAC-SHA256 key and tag length.
pub const MAC_SIZE: usize = 32;

/// AES block / CBC IV length.
pub const IV_SIZE: usize = 16;

/// Length of client and server handshake randoms.
pub const RANDOM_SIZE: usize = 32;

/// HKDF info label for cipher state derivation.
///
/// Both peers must use the same label or their states will not match.
pub const KEY_EXPANSION_LABEL: &[u8] = b"sessionwire key expansion";

// ============================================================================
// Pooling
// ============================================================================

/// Number of physical HTTP channels kept per remote server.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Length of the logical channel id prefixed to every WebSocket frame.
pub const WS_CHANNEL_ID_SIZE: usize = 4;

// ============================================================================
// Tickets
// ============================================================================

/// Safety margin subtracted from every ticket's server-announced lifetime.
///
/// A ticket is considered expired this long before the server would reject
/// it, so in-flight requests never race the server-side expiry.
pub const MIN_TICKET_TTL_MARGIN: Duration = Duration::from_secs(10);

/// Ask for fresh tickets once the newest ticket expires within this window.
pub const TICKET_HORIZON_THRESHOLD: Duration = Duration::from_secs(60);

/// Tickets requested from the server per refill.
pub const DEFAULT_TICKETS_REQUEST: u32 = 10;

/// Ask for more tickets once fewer than this many remain.
pub const DEFAULT_TICKETS_MIN: usize = 3;

/// Interval of the background sweep that drops expired tickets.
pub const TICKET_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

// ============================================================================
// Timeouts
// ============================================================================

/// Per-call timeout when the caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for reachability probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout for physical HTTP channels.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default API path for record POSTs.
pub const DEFAULT_API_PATH: &str = "/api/v2.0";

/// Default path of the shared WebSocket endpoint.
pub const DEFAULT_WS_PATH: &str = "/api/v2.0/ws";
