//! Key agreement: handshake messages and the strategies that bootstrap a session.
//!
//! Every strategy produces the same thing, an [`Established`] bundle holding
//! the master secret and both randoms, from which the record layer derives a
//! fresh [`CipherPair`](crate::record::CipherPair). They differ only in how
//! the secret is obtained:
//!
//! | Strategy | Round trips | Master secret |
//! |---|---|---|
//! | [`srp`] | 2 | SRP-6a session key `K` |
//! | [`ecdhe`] | 1 | P-256 ECDH shared secret |
//! | [`static_key`] | 1 | pre-shared key |
//! | [`resume`] | 0 | master secret of a stored ticket |
//!
//! The server finishes every full handshake with a ChangeCipherSpec; the
//! resume flight carries the client's own ChangeCipherSpec.

pub mod ecdhe;
pub mod resume;
pub mod srp;
pub mod static_key;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::codec;
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};
use crate::record::{get_fresh_rw_states, RecordHandler, RecordLayer, Role};

pub use ecdhe::EcdheClient;
pub use resume::ResumeClient;
pub use srp::{DefaultPasswordMixer, PasswordMixer, SrpClient, SrpGroup, SrpServer};
pub use static_key::StaticKeyClient;

/// Root secret of one handshake. Wiped on drop.
pub type MasterSecret = Zeroizing<Vec<u8>>;

/// Handshake messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientHandshake {
    /// SRP step 1: announce the identity.
    SrpInit {
        /// SRP identity `I`.
        #[serde(rename = "I")]
        identity: String,
        /// Host the client believes it is talking to.
        host: String,
        /// Base64 client random.
        #[serde(rename = "clientRandom")]
        client_random: String,
    },
    /// SRP step 2: public value and proof.
    SrpExchange {
        /// Hex public value `A`.
        #[serde(rename = "A")]
        a_pub: String,
        /// Hex client proof `M1`.
        #[serde(rename = "M1")]
        m1: String,
        /// Server-issued handshake id.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Number of tickets requested.
        tickets: u32,
    },
    /// ECDHE: ephemeral public key.
    Ecdhe {
        /// Base64 compressed P-256 point.
        key: String,
        /// Base64 client random.
        #[serde(rename = "clientRandom")]
        client_random: String,
        /// Number of tickets requested.
        tickets: u32,
    },
    /// Static key: key identifier.
    Key {
        /// Identifier of the pre-shared key.
        #[serde(rename = "keyId")]
        key_id: String,
        /// Base64 client random.
        #[serde(rename = "clientRandom")]
        client_random: String,
        /// Number of tickets requested.
        tickets: u32,
    },
    /// Resume: present a ticket.
    Ticket {
        /// Ticket id.
        ticket: String,
        /// Base64 client random.
        #[serde(rename = "clientRandom")]
        client_random: String,
    },
    /// Ask for more tickets on an established connection.
    TicketRequest {
        /// Number of tickets requested.
        count: u32,
    },
}

/// Handshake messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerHandshake {
    /// SRP challenge.
    SrpInit {
        /// Handshake id to echo back.
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Hex salt.
        s: String,
        /// Hex server public value.
        #[serde(rename = "B")]
        b_pub: String,
        /// Hex group modulus.
        #[serde(rename = "N")]
        modulus: String,
        /// Hex group generator.
        g: String,
        /// Hex multiplier.
        k: String,
        /// Password mixing parameters, if any.
        #[serde(rename = "loginData", default)]
        login_data: Option<serde_json::Value>,
        /// Base64 server random.
        #[serde(rename = "serverRandom")]
        server_random: String,
    },
    /// SRP server proof plus issued tickets.
    SrpExchange {
        /// Hex server proof `M2`.
        #[serde(rename = "M2")]
        m2: String,
        /// Issued ticket ids.
        #[serde(default)]
        tickets: Vec<String>,
        /// Ticket lifetime in seconds.
        #[serde(default)]
        ttl: u64,
    },
    /// ECDHE server key.
    Ecdhe {
        /// Base64 compressed P-256 point.
        key: String,
        /// Base64 server random.
        #[serde(rename = "serverRandom")]
        server_random: String,
        /// Issued ticket ids.
        #[serde(default)]
        tickets: Vec<String>,
        /// Ticket lifetime in seconds.
        #[serde(default)]
        ttl: u64,
    },
    /// Static key accepted.
    Key {
        /// Base64 server random.
        #[serde(rename = "serverRandom")]
        server_random: String,
        /// Issued ticket ids.
        #[serde(default)]
        tickets: Vec<String>,
        /// Ticket lifetime in seconds.
        #[serde(default)]
        ttl: u64,
    },
    /// Answer to [`ClientHandshake::TicketRequest`].
    TicketResponse {
        /// Issued ticket ids.
        tickets: Vec<String>,
        /// Ticket lifetime in seconds.
        ttl: u64,
    },
}

/// Outcome of a completed key agreement.
pub struct Established {
    /// Root secret for state derivation and ticket storage.
    pub master_secret: MasterSecret,
    /// Client random used for state derivation.
    pub client_random: Vec<u8>,
    /// Server random used for state derivation.
    pub server_random: Vec<u8>,
    /// Tickets issued with the handshake.
    pub tickets: Vec<String>,
    /// Lifetime of the issued tickets, in seconds.
    pub ttl_secs: u64,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("tickets", &self.tickets.len())
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

/// First flight of a strategy.
#[derive(Debug)]
pub struct Opening {
    /// Messages to send.
    pub messages: Vec<ClientHandshake>,
    /// Set when the strategy is already established (0-RTT resume).
    pub established: Option<Established>,
}

/// What to do after a server message.
#[derive(Debug)]
pub enum Step {
    /// Send this message and keep waiting.
    Reply(ClientHandshake),
    /// The agreement finished.
    Established(Established),
}

/// How a session authenticates.
#[derive(Clone)]
pub enum Strategy {
    /// SRP-6a password proof.
    Srp {
        /// SRP identity.
        username: String,
        /// Plain password, mixed with the server's `loginData`.
        password: String,
        /// Custom mixing step; [`DefaultPasswordMixer`] when `None`.
        mixer: Option<Arc<dyn PasswordMixer>>,
    },
    /// Anonymous ephemeral ECDH.
    Ecdhe,
    /// Pre-shared static key.
    Key {
        /// Identifier the server looks the key up by.
        key_id: String,
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Resume from tickets obtained elsewhere. No full handshake is possible,
    /// so the session fails with [`SessionError::NoTickets`] once they run out.
    Resume {
        /// Ticket ids.
        tickets: Vec<String>,
        /// Ticket lifetime in seconds.
        ttl_secs: u64,
        /// Master secret the tickets were issued under.
        master_secret: Vec<u8>,
    },
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Srp { username, .. } => f.debug_struct("Srp").field("username", username).finish(),
            Self::Ecdhe => f.write_str("Ecdhe"),
            Self::Key { key_id, .. } => f.debug_struct("Key").field("key_id", key_id).finish(),
            Self::Resume { tickets, .. } => f
                .debug_struct("Resume")
                .field("tickets", &tickets.len())
                .finish(),
        }
    }
}

impl Strategy {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Srp { .. } => "srp",
            Self::Ecdhe => "ecdhe",
            Self::Key { .. } => "key",
            Self::Resume { .. } => "resume",
        }
    }

    /// Whether this strategy can run a full handshake (and thus refill tickets).
    pub fn supports_full_handshake(&self) -> bool {
        !matches!(self, Self::Resume { .. })
    }

    /// Build a fresh key agreement for one handshake attempt.
    ///
    /// `host` is announced in the SRP init message; `tickets` is the number
    /// of tickets requested from the server.
    pub fn key_agreement(
        &self,
        crypto: &Arc<dyn CryptoService>,
        host: &str,
        tickets: u32,
    ) -> Result<KeyAgreement> {
        match self {
            Self::Srp {
                username,
                password,
                mixer,
            } => {
                let mixer = mixer
                    .clone()
                    .unwrap_or_else(|| Arc::new(DefaultPasswordMixer::new(Arc::clone(crypto))));
                let mut client = SrpClient::new(Arc::clone(crypto), mixer, host, tickets);
                client.init(username, password)?;
                Ok(KeyAgreement::Srp(client))
            }
            Self::Ecdhe => Ok(KeyAgreement::Ecdhe(EcdheClient::new(
                Arc::clone(crypto),
                tickets,
            ))),
            Self::Key { key_id, key } => Ok(KeyAgreement::Key(StaticKeyClient::new(
                Arc::clone(crypto),
                key_id,
                key,
                tickets,
            )?)),
            Self::Resume { .. } => Err(SessionError::InvalidState(
                "resume strategy has no full handshake".into(),
            )),
        }
    }
}

/// A key-agreement strategy, dispatched by session options.
#[derive(Debug)]
pub enum KeyAgreement {
    /// SRP-6a password proof.
    Srp(SrpClient),
    /// Ephemeral ECDH.
    Ecdhe(EcdheClient),
    /// Static pre-shared key.
    Key(StaticKeyClient),
    /// Ticket resumption.
    Resume(ResumeClient),
}

impl KeyAgreement {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Srp(_) => "srp",
            Self::Ecdhe(_) => "ecdhe",
            Self::Key(_) => "key",
            Self::Resume(_) => "resume",
        }
    }

    /// Produce the first flight.
    pub fn start(&mut self) -> Result<Opening> {
        match self {
            Self::Srp(client) => Ok(Opening {
                messages: vec![client.start()?],
                established: None,
            }),
            Self::Ecdhe(client) => Ok(Opening {
                messages: vec![client.start()?],
                established: None,
            }),
            Self::Key(client) => Ok(Opening {
                messages: vec![client.start()?],
                established: None,
            }),
            Self::Resume(client) => {
                let (message, established) = client.start()?;
                Ok(Opening {
                    messages: vec![message],
                    established: Some(established),
                })
            }
        }
    }

    /// Feed one server handshake message.
    pub fn on_message(&mut self, message: ServerHandshake) -> Result<Step> {
        match self {
            Self::Srp(client) => client.on_message(message),
            Self::Ecdhe(client) => client.on_message(message),
            Self::Key(client) => client.on_message(message),
            Self::Resume(_) => Err(SessionError::Protocol(format!(
                "unexpected {} message during resume",
                message.kind()
            ))),
        }
    }
}

impl ServerHandshake {
    /// Wire `type` tag, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SrpInit { .. } => "srp_init",
            Self::SrpExchange { .. } => "srp_exchange",
            Self::Ecdhe { .. } => "ecdhe",
            Self::Key { .. } => "key",
            Self::TicketResponse { .. } => "ticket_response",
        }
    }
}

/// Drives a [`KeyAgreement`] from inside [`RecordLayer::process`].
///
/// Server replies are fed to the agreement; client replies are queued in
/// `outbound` for the next flight. Once the agreement is established the
/// next cipher states are installed, ready for the server's ChangeCipherSpec.
pub struct HandshakeHandler<'a> {
    agreement: &'a mut KeyAgreement,
    outbound: Vec<ClientHandshake>,
    established: Option<Established>,
}

impl<'a> HandshakeHandler<'a> {
    /// Wrap an agreement whose opening flight has been sent.
    pub fn new(agreement: &'a mut KeyAgreement) -> Self {
        Self {
            agreement,
            outbound: Vec::new(),
            established: None,
        }
    }

    /// Messages queued for the next flight.
    pub fn take_outbound(&mut self) -> Vec<ClientHandshake> {
        std::mem::take(&mut self.outbound)
    }

    /// Completed agreement, once available.
    pub fn take_established(&mut self) -> Option<Established> {
        self.established.take()
    }

    /// `true` once the agreement has produced a master secret.
    pub fn is_established(&self) -> bool {
        self.established.is_some()
    }
}

impl RecordHandler for HandshakeHandler<'_> {
    fn on_handshake(&mut self, layer: &RecordLayer, payload: Vec<u8>) -> Result<()> {
        let message: ServerHandshake = codec::from_slice(&payload)?;
        log::debug!(
            "[Handshake] {} received {}",
            self.agreement.name(),
            message.kind()
        );
        match self.agreement.on_message(message)? {
            Step::Reply(reply) => self.outbound.push(reply),
            Step::Established(established) => {
                install_states(layer, &established)?;
                self.established = Some(established);
            }
        }
        Ok(())
    }

    fn on_application_data(&mut self, _layer: &RecordLayer, _payload: Vec<u8>) -> Result<()> {
        Err(SessionError::Protocol(
            "application data before handshake completion".into(),
        ))
    }
}

/// Derive states for `established` and stage them on `layer`.
pub fn install_states(layer: &RecordLayer, established: &Established) -> Result<()> {
    let pair = get_fresh_rw_states(
        layer.crypto().as_ref(),
        &established.master_secret,
        &established.client_random,
        &established.server_random,
        layer.role(),
    )?;
    layer.set_next_states(pair);
    Ok(())
}

/// Decode a base64 wire field.
pub(crate) fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD
        .decode(value)
        .map_err(|e| SessionError::Protocol(format!("invalid base64 in {field}: {e}")))
}

/// Encode bytes for a base64 wire field.
pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(bytes)
}

/// Lowercase hex of `bytes`.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex wire field. Odd lengths get a leading zero nibble.
pub(crate) fn from_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    let padded;
    let value = if value.len() % 2 == 1 {
        padded = format!("0{value}");
        padded.as_str()
    } else {
        value
    };
    (0..value.len())
        .step_by(2)
        .map(|i| {
            value
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| SessionError::Protocol(format!("invalid hex in {field}")))
        })
        .collect()
}
