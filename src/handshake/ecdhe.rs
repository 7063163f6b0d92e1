//! Anonymous ephemeral ECDH over P-256.
//!
//! The master secret is the 32-byte x coordinate of `private * peer_public`.

use std::sync::Arc;

use zeroize::Zeroizing;

use super::{decode_b64, encode_b64, ClientHandshake, Established, ServerHandshake, Step};
use crate::constants::RANDOM_SIZE;
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};

enum EcdheState {
    Idle,
    Awaiting {
        private_key: Zeroizing<Vec<u8>>,
        client_random: Vec<u8>,
    },
    Finished,
}

/// Client side of the ECDHE strategy.
pub struct EcdheClient {
    crypto: Arc<dyn CryptoService>,
    tickets: u32,
    state: EcdheState,
}

impl std::fmt::Debug for EcdheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            EcdheState::Idle => "idle",
            EcdheState::Awaiting { .. } => "awaiting server key",
            EcdheState::Finished => "finished",
        };
        f.debug_struct("EcdheClient").field("state", &state).finish()
    }
}

impl EcdheClient {
    /// New client requesting `tickets` tickets.
    pub fn new(crypto: Arc<dyn CryptoService>, tickets: u32) -> Self {
        Self {
            crypto,
            tickets,
            state: EcdheState::Idle,
        }
    }

    /// Generate the ephemeral key and build the `ecdhe` greeting.
    pub fn start(&mut self) -> Result<ClientHandshake> {
        if !matches!(self.state, EcdheState::Idle) {
            return Err(SessionError::InvalidState("ECDHE handshake already started".into()));
        }
        let pair = self.crypto.ec_generate_key()?;
        let client_random = self.crypto.random_bytes(RANDOM_SIZE);
        let message = ClientHandshake::Ecdhe {
            key: encode_b64(&pair.public_key),
            client_random: encode_b64(&client_random),
            tickets: self.tickets,
        };
        self.state = EcdheState::Awaiting {
            private_key: pair.private_key,
            client_random,
        };
        Ok(message)
    }

    /// Combine the server key with the ephemeral private key.
    pub fn on_message(&mut self, message: ServerHandshake) -> Result<Step> {
        let EcdheState::Awaiting {
            private_key,
            client_random,
        } = std::mem::replace(&mut self.state, EcdheState::Finished)
        else {
            return Err(SessionError::InvalidState(format!(
                "unexpected {} outside an ECDHE exchange",
                message.kind()
            )));
        };
        let ServerHandshake::Ecdhe {
            key,
            server_random,
            tickets,
            ttl,
        } = message
        else {
            return Err(SessionError::Protocol(format!(
                "expected ecdhe, got {}",
                message.kind()
            )));
        };

        let peer = decode_b64("key", &key)?;
        let shared = self
            .crypto
            .ec_shared_secret(&private_key, &peer)
            .map_err(|e| SessionError::Auth(format!("invalid server key: {e}")))?;
        Ok(Step::Established(Established {
            master_secret: shared,
            client_random,
            server_random: decode_b64("serverRandom", &server_random)?,
            tickets,
            ttl_secs: ttl,
        }))
    }
}
