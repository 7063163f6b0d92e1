//! Static pre-shared key strategy.
//!
//! The key itself is the master secret; fresh randoms from both sides keep
//! the derived cipher states unique per handshake.

use std::sync::Arc;

use zeroize::Zeroizing;

use super::{decode_b64, encode_b64, ClientHandshake, Established, ServerHandshake, Step};
use crate::constants::RANDOM_SIZE;
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};

/// Client side of the static-key strategy.
pub struct StaticKeyClient {
    crypto: Arc<dyn CryptoService>,
    key_id: String,
    key: Zeroizing<Vec<u8>>,
    tickets: u32,
    client_random: Option<Vec<u8>>,
}

impl std::fmt::Debug for StaticKeyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyClient")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl StaticKeyClient {
    /// Client for the key registered on the server under `key_id`.
    pub fn new(crypto: Arc<dyn CryptoService>, key_id: &str, key: &[u8], tickets: u32) -> Result<Self> {
        if key_id.is_empty() || key.is_empty() {
            return Err(SessionError::InvalidState(
                "static key id and key must be non-empty".into(),
            ));
        }
        Ok(Self {
            crypto,
            key_id: key_id.to_string(),
            key: Zeroizing::new(key.to_vec()),
            tickets,
            client_random: None,
        })
    }

    /// Build the `key` greeting.
    pub fn start(&mut self) -> Result<ClientHandshake> {
        if self.client_random.is_some() {
            return Err(SessionError::InvalidState("static key handshake already started".into()));
        }
        let client_random = self.crypto.random_bytes(RANDOM_SIZE);
        let message = ClientHandshake::Key {
            key_id: self.key_id.clone(),
            client_random: encode_b64(&client_random),
            tickets: self.tickets,
        };
        self.client_random = Some(client_random);
        Ok(message)
    }

    /// Accept the server's random and finish.
    pub fn on_message(&mut self, message: ServerHandshake) -> Result<Step> {
        let client_random = self.client_random.take().ok_or_else(|| {
            SessionError::InvalidState("static key handshake not started".into())
        })?;
        match message {
            ServerHandshake::Key {
                server_random,
                tickets,
                ttl,
            } => Ok(Step::Established(Established {
                master_secret: self.key.clone(),
                client_random,
                server_random: decode_b64("serverRandom", &server_random)?,
                tickets,
                ttl_secs: ttl,
            })),
            other => Err(SessionError::Protocol(format!(
                "expected key, got {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptoService;

    fn crypto() -> Arc<dyn CryptoService> {
        Arc::new(DefaultCryptoService)
    }

    #[test]
    fn test_key_becomes_master_secret() {
        let mut client = StaticKeyClient::new(crypto(), "device-1", &[5u8; 32], 2).unwrap();
        let ClientHandshake::Key { key_id, .. } = client.start().unwrap() else {
            panic!("expected key greeting");
        };
        assert_eq!(key_id, "device-1");

        let step = client
            .on_message(ServerHandshake::Key {
                server_random: encode_b64(&[1u8; 32]),
                tickets: vec!["t".into()],
                ttl: 60,
            })
            .unwrap();
        let Step::Established(established) = step else {
            panic!("expected established");
        };
        assert_eq!(*established.master_secret, vec![5u8; 32]);
        assert_eq!(established.client_random.len(), RANDOM_SIZE);
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(StaticKeyClient::new(crypto(), "", &[1], 1).is_err());
        assert!(StaticKeyClient::new(crypto(), "id", &[], 1).is_err());
    }

    #[test]
    fn test_wrong_reply_type() {
        let mut client = StaticKeyClient::new(crypto(), "id", &[1], 1).unwrap();
        client.start().unwrap();
        let err = client
            .on_message(ServerHandshake::TicketResponse {
                tickets: vec![],
                ttl: 0,
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }
}
