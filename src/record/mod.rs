//! Record layer: framing and the cipher-state machine.
//!
//! Every message on the wire is a record:
//!
//! ```text
//! [content_type: u8] [CBOR byte string: body]
//! ```
//!
//! Content types:
//! - `20`: ChangeCipherSpec - promotes the prepared read/write states together
//! - `21`: Alert - `{level, description}`; fatal alerts tear the session down
//! - `22`: Handshake - forwarded to the active key agreement
//! - `23`: ApplicationData - forwarded to the call correlator
//!
//! While unkeyed, the body is the CBOR-encoded message itself. Once keyed, the
//! body is `iv || AES-256-CBC(message) || HMAC` under the current state for
//! that direction, with the implicit sequence number and content type
//! authenticated by the MAC. Records are self-delimiting, so a single HTTP
//! body or WebSocket frame can carry several.
//!
//! # States
//!
//! ```text
//! Unkeyed ──set_next_states──▶ Pending ──ChangeCipherSpec──▶ Encrypted
//!    (plaintext only)   (plaintext, next states ready)    (everything keyed)
//! ```
//!
//! Any MAC, sequence or framing error moves the layer to a terminal failed
//! state; every later operation reports the original failure.

// Rust guideline compliant 2026-02

pub mod cipher_state;

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::constants::{
    CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE,
};
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};

pub use cipher_state::{get_fresh_rw_states, CipherPair, CipherState, Role};

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    /// Promote the prepared cipher states.
    ChangeCipherSpec,
    /// Warning or fatal notification.
    Alert,
    /// Key agreement message.
    Handshake,
    /// Application call or reply.
    ApplicationData,
}

impl ContentType {
    /// Wire byte for this content type.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::ChangeCipherSpec => CONTENT_CHANGE_CIPHER_SPEC,
            Self::Alert => CONTENT_ALERT,
            Self::Handshake => CONTENT_HANDSHAKE,
            Self::ApplicationData => CONTENT_APPLICATION_DATA,
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = SessionError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            CONTENT_CHANGE_CIPHER_SPEC => Ok(Self::ChangeCipherSpec),
            CONTENT_ALERT => Ok(Self::Alert),
            CONTENT_HANDSHAKE => Ok(Self::Handshake),
            CONTENT_APPLICATION_DATA => Ok(Self::ApplicationData),
            other => Err(SessionError::Protocol(format!(
                "unknown content type: {other}"
            ))),
        }
    }
}

/// A decoded (plaintext) record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Content type tag.
    pub content_type: ContentType,
    /// Plaintext body (CBOR-encoded message).
    pub payload: Vec<u8>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Logged and ignored.
    Warning,
    /// Tears the session down.
    Fatal,
}

/// Alert record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Severity.
    pub level: AlertLevel,
    /// Human-readable reason.
    pub description: String,
}

/// Coarse layer state, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPhase {
    /// No key material; only plaintext records.
    Unkeyed,
    /// Next states are prepared, still sending plaintext.
    Pending,
    /// Current states are active in both directions.
    Encrypted,
    /// A fatal error occurred; the layer refuses further work.
    Failed,
}

/// Receives decoded records from [`RecordLayer::process`].
///
/// Handlers run without the layer lock held, so they may call back into the
/// layer (typically [`RecordLayer::set_next_states`] before a pending
/// ChangeCipherSpec is processed).
pub trait RecordHandler {
    /// A Handshake record arrived.
    fn on_handshake(&mut self, layer: &RecordLayer, payload: Vec<u8>) -> Result<()>;

    /// An ApplicationData record arrived.
    fn on_application_data(&mut self, layer: &RecordLayer, payload: Vec<u8>) -> Result<()>;

    /// A ChangeCipherSpec was applied.
    fn on_change_cipher_spec(&mut self, _layer: &RecordLayer) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LayerState {
    current: CipherPair,
    next: Option<CipherPair>,
    failure: Option<SessionError>,
}

impl LayerState {
    fn ensure_alive(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Swap the prepared states in for both directions at once.
    fn promote(&mut self) -> Result<()> {
        let next = self.next.take().ok_or_else(|| {
            SessionError::Protocol("ChangeCipherSpec without prepared cipher states".into())
        })?;
        self.current = next;
        Ok(())
    }
}

/// Body of every ChangeCipherSpec record.
const CHANGE_CIPHER_SPEC_BODY: u8 = 1;

fn check_change_cipher_spec(payload: &[u8]) -> Result<()> {
    match codec::from_slice::<u64>(payload) {
        Ok(value) if value == u64::from(CHANGE_CIPHER_SPEC_BODY) => Ok(()),
        Ok(value) => Err(SessionError::Protocol(format!(
            "unexpected ChangeCipherSpec body: {value}"
        ))),
        Err(e) => Err(SessionError::Protocol(format!(
            "malformed ChangeCipherSpec body: {e}"
        ))),
    }
}

/// Framing plus cipher-state machine for one logical connection.
pub struct RecordLayer {
    crypto: Arc<dyn CryptoService>,
    role: Role,
    state: Mutex<LayerState>,
}

impl std::fmt::Debug for RecordLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLayer")
            .field("role", &self.role)
            .field("phase", &self.phase())
            .finish()
    }
}

impl RecordLayer {
    /// Create an unkeyed layer.
    pub fn new(crypto: Arc<dyn CryptoService>, role: Role) -> Self {
        Self {
            crypto,
            role,
            state: Mutex::new(LayerState::default()),
        }
    }

    /// Which end of the connection this layer serves.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Crypto backend used by this layer.
    pub fn crypto(&self) -> &Arc<dyn CryptoService> {
        &self.crypto
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LayerState> {
        self.state.lock().expect("RecordLayer mutex poisoned")
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> LayerPhase {
        let state = self.lock();
        if state.failure.is_some() {
            LayerPhase::Failed
        } else if state.current.write.initialized() {
            LayerPhase::Encrypted
        } else if state.next.is_some() {
            LayerPhase::Pending
        } else {
            LayerPhase::Unkeyed
        }
    }

    /// `true` once outbound records are encrypted.
    pub fn is_keyed(&self) -> bool {
        self.phase() == LayerPhase::Encrypted
    }

    /// Sequence numbers of the current (read, write) states.
    pub fn sequence_numbers(&self) -> (u64, u64) {
        let state = self.lock();
        (
            state.current.read.sequence_number(),
            state.current.write.sequence_number(),
        )
    }

    /// Install the states a later ChangeCipherSpec will promote.
    pub fn set_next_states(&self, pair: CipherPair) {
        self.lock().next = Some(pair);
    }

    /// Mark the layer as failed; pending and future operations see `err`.
    pub fn fail(&self, err: SessionError) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(err);
        }
    }

    /// Frame `payload` as one record.
    ///
    /// The record is sent in the clear when `force_plaintext` is set or the
    /// write state is not initialized; otherwise it is encrypted and the write
    /// sequence number advances.
    pub fn send(
        &self,
        payload: &[u8],
        content_type: ContentType,
        force_plaintext: bool,
    ) -> Result<Vec<u8>> {
        let mut state = self.lock();
        self.frame(&mut state, payload, content_type, force_plaintext)
    }

    fn frame(
        &self,
        state: &mut LayerState,
        payload: &[u8],
        content_type: ContentType,
        force_plaintext: bool,
    ) -> Result<Vec<u8>> {
        state.ensure_alive()?;

        let body = if force_plaintext || !state.current.write.initialized() {
            payload.to_vec()
        } else {
            match state
                .current
                .write
                .encrypt(self.crypto.as_ref(), content_type.as_byte(), payload)
            {
                Ok(sealed) => sealed,
                Err(err) => {
                    state.failure = Some(err.clone());
                    return Err(err);
                }
            }
        };

        let mut out = Vec::with_capacity(body.len() + 10);
        out.push(content_type.as_byte());
        out.extend(codec::byte_string(&body)?);
        Ok(out)
    }

    /// Encode `message` with CBOR and frame it.
    pub fn send_message<T: Serialize>(
        &self,
        message: &T,
        content_type: ContentType,
        force_plaintext: bool,
    ) -> Result<Vec<u8>> {
        self.send(&codec::to_vec(message)?, content_type, force_plaintext)
    }

    /// Emit a ChangeCipherSpec and promote the prepared states.
    ///
    /// The record itself goes out under the state that was current before
    /// the switch.
    pub fn change_cipher_spec(&self) -> Result<Vec<u8>> {
        let body = codec::to_vec(&CHANGE_CIPHER_SPEC_BODY)?;
        let mut state = self.lock();
        let record = self.frame(&mut state, &body, ContentType::ChangeCipherSpec, false)?;
        if let Err(err) = state.promote() {
            state.failure = Some(err.clone());
            return Err(err);
        }
        log::debug!("[Record] {:?} switched to prepared cipher states", self.role);
        Ok(record)
    }

    /// Emit an alert record. Fatal alerts also fail this layer.
    pub fn send_alert(&self, level: AlertLevel, description: &str) -> Result<Vec<u8>> {
        let alert = Alert {
            level,
            description: description.to_string(),
        };
        let record = self.send_message(&alert, ContentType::Alert, false)?;
        if level == AlertLevel::Fatal {
            self.fail(SessionError::Alert(format!("sent: {description}")));
        }
        Ok(record)
    }

    /// Decode one record from the cursor under the current read state.
    fn read_record(&self, cursor: &mut Cursor<&[u8]>) -> Result<Record> {
        let mut state = self.lock();
        state.ensure_alive()?;

        let position = cursor.position() as usize;
        let type_byte = *cursor
            .get_ref()
            .get(position)
            .ok_or_else(|| SessionError::Protocol("truncated record header".into()))?;
        cursor.set_position(position as u64 + 1);

        let result = ContentType::try_from(type_byte).and_then(|content_type| {
            let body = codec::read_byte_string(cursor)
                .map_err(|e| SessionError::Protocol(format!("malformed record body: {e}")))?;
            let payload = if state.current.read.initialized() {
                state
                    .current
                    .read
                    .decrypt(self.crypto.as_ref(), type_byte, &body)?
            } else {
                body
            };
            Ok(Record {
                content_type,
                payload,
            })
        });

        match result {
            Ok(record) => Ok(record),
            Err(err) => {
                state.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Decode every record in `input` and dispatch it.
    ///
    /// ChangeCipherSpec records are applied here; Handshake and
    /// ApplicationData records go to `handler`; warning alerts are logged
    /// and fatal alerts fail the layer. Handler errors fail the layer too.
    pub fn process(&self, input: &[u8], handler: &mut dyn RecordHandler) -> Result<()> {
        let mut cursor = Cursor::new(input);
        while (cursor.position() as usize) < input.len() {
            let record = self.read_record(&mut cursor)?;
            let outcome = match record.content_type {
                ContentType::ChangeCipherSpec => {
                    let promoted = check_change_cipher_spec(&record.payload)
                        .and_then(|()| self.lock().promote());
                    promoted.and_then(|()| {
                        log::debug!("[Record] {:?} peer switched cipher states", self.role);
                        handler.on_change_cipher_spec(self)
                    })
                }
                ContentType::Alert => self.handle_alert(&record.payload),
                ContentType::Handshake => handler.on_handshake(self, record.payload),
                ContentType::ApplicationData => {
                    handler.on_application_data(self, record.payload)
                }
            };
            if let Err(err) = outcome {
                self.fail(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    fn handle_alert(&self, payload: &[u8]) -> Result<()> {
        let alert: Alert = codec::from_slice(payload)?;
        match alert.level {
            AlertLevel::Warning => {
                log::warn!("[Record] Peer warning alert: {}", alert.description);
                Ok(())
            }
            AlertLevel::Fatal => Err(SessionError::Alert(alert.description)),
        }
    }
}
