//! Ticket resumption (0-RTT).
//!
//! The client presents a ticket id with a fresh client random and switches
//! cipher states immediately. Both peers derive states from the ticket's
//! master secret, using the ticket id bytes as the server random.

use std::sync::Arc;

use super::{encode_b64, ClientHandshake, Established};
use crate::constants::RANDOM_SIZE;
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};
use crate::tickets::SessionTicket;

/// Server random used when resuming `ticket_id`.
pub fn ticket_server_random(ticket_id: &str) -> Vec<u8> {
    ticket_id.as_bytes().to_vec()
}

/// Client side of a resume handshake. Consumes its ticket once.
pub struct ResumeClient {
    crypto: Arc<dyn CryptoService>,
    ticket: Option<SessionTicket>,
}

impl std::fmt::Debug for ResumeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeClient")
            .field("ticket", &self.ticket.as_ref().map(|t| t.short_id()))
            .finish()
    }
}

impl ResumeClient {
    /// Resume with `ticket`.
    pub fn new(crypto: Arc<dyn CryptoService>, ticket: SessionTicket) -> Self {
        Self {
            crypto,
            ticket: Some(ticket),
        }
    }

    /// Build the `ticket` message together with the established secret.
    pub fn start(&mut self) -> Result<(ClientHandshake, Established)> {
        let ticket = self
            .ticket
            .take()
            .ok_or_else(|| SessionError::InvalidState("ticket already consumed".into()))?;
        let client_random = self.crypto.random_bytes(RANDOM_SIZE);
        let message = ClientHandshake::Ticket {
            ticket: ticket.id.clone(),
            client_random: encode_b64(&client_random),
        };
        Ok((
            message,
            Established {
                server_random: ticket_server_random(&ticket.id),
                master_secret: ticket.master_secret,
                client_random,
                tickets: Vec::new(),
                ttl_secs: 0,
            },
        ))
    }
}
