//! Record flights over pooled HTTP slots.
//!
//! Each POST carries one flight of concatenated records and its response
//! carries the server's flight. Every flight runs on its own [`RecordLayer`]:
//!
//! ```text
//! full handshake   [hs...] ─▶ [hs...] (repeat) ─▶ ... [hs][CCS]
//! resumed call     [ticket][CCS][ticket_request?][call] ─▶ [ticket_response?][reply]
//! plain call       [call] ─▶ [reply]                      (never keyed)
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::channel::ChannelPool;
use crate::codec;
use crate::correlator::{ReplyFrame, RequestCorrelator};
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};
use crate::handshake::{
    install_states, ClientHandshake, Established, HandshakeHandler, KeyAgreement, ResumeClient,
    ServerHandshake,
};
use crate::record::{ContentType, RecordHandler, RecordLayer, Role};
use crate::tickets::SessionTicketPool;

/// Where flights for one server go.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub(crate) pool: Arc<ChannelPool>,
    pub(crate) url: String,
}

impl Endpoint {
    /// POST one flight through a pooled slot and return the response body.
    pub(crate) async fn post(&self, body: Vec<u8>) -> Result<Vec<u8>> {
        let slot = self.pool.acquire().await?;
        let response = slot.post(&self.url, body).await?;
        Ok(response.body)
    }
}

/// Handles records on an authenticated (or plain) connection: replies go to
/// the correlator, ticket responses to the ticket pool.
pub(crate) struct ReplyHandler<'a> {
    correlator: &'a RequestCorrelator,
    tickets: Option<(&'a SessionTicketPool, &'a [u8])>,
    refilled: usize,
}

impl<'a> ReplyHandler<'a> {
    pub(crate) fn new(
        correlator: &'a RequestCorrelator,
        tickets: Option<(&'a SessionTicketPool, &'a [u8])>,
    ) -> Self {
        Self {
            correlator,
            tickets,
            refilled: 0,
        }
    }

    /// Tickets stored while processing.
    pub(crate) fn refilled(&self) -> usize {
        self.refilled
    }
}

impl RecordHandler for ReplyHandler<'_> {
    fn on_handshake(&mut self, _layer: &RecordLayer, payload: Vec<u8>) -> Result<()> {
        match codec::from_slice::<ServerHandshake>(&payload)? {
            ServerHandshake::TicketResponse { tickets, ttl } => {
                let Some((pool, master_secret)) = self.tickets else {
                    return Err(SessionError::Protocol(
                        "ticket_response on an unauthenticated exchange".into(),
                    ));
                };
                pool.save_tickets(&tickets, ttl, master_secret);
                self.refilled += tickets.len();
                Ok(())
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected {} on an established connection",
                other.kind()
            ))),
        }
    }

    fn on_application_data(&mut self, _layer: &RecordLayer, payload: Vec<u8>) -> Result<()> {
        let reply: ReplyFrame = codec::from_slice(&payload)?;
        self.correlator.resolve(reply);
        Ok(())
    }
}

/// Run a full key agreement to completion.
///
/// The server must close the exchange with a ChangeCipherSpec; an agreement
/// that finishes without one is a protocol error.
pub(crate) async fn full_handshake(
    endpoint: &Endpoint,
    crypto: &Arc<dyn CryptoService>,
    mut agreement: KeyAgreement,
) -> Result<Established> {
    let layer = RecordLayer::new(Arc::clone(crypto), Role::Client);
    let opening = agreement.start()?;
    let mut outbound = opening.messages;
    let mut round = 0usize;

    loop {
        round += 1;
        let mut body = Vec::new();
        for message in &outbound {
            body.extend(layer.send_message(message, ContentType::Handshake, false)?);
        }
        log::debug!(
            "[Session] {} handshake round {} ({} messages)",
            agreement.name(),
            round,
            outbound.len()
        );
        let response = endpoint.post(body).await?;

        let mut handler = HandshakeHandler::new(&mut agreement);
        layer.process(&response, &mut handler)?;
        if let Some(established) = handler.take_established() {
            if !layer.is_keyed() {
                return Err(SessionError::Protocol(
                    "server did not switch cipher states".into(),
                ));
            }
            return Ok(established);
        }
        outbound = handler.take_outbound();
        if outbound.is_empty() {
            return Err(SessionError::Protocol("handshake stalled".into()));
        }
    }
}

/// Outcome of a resumed call.
#[derive(Debug)]
pub(crate) struct ResumedReply {
    pub(crate) result: Result<Value>,
    pub(crate) refilled: usize,
}

/// Spend one ticket on a single call, optionally asking for more tickets.
pub(crate) async fn resumed_call(
    endpoint: &Endpoint,
    crypto: &Arc<dyn CryptoService>,
    tickets: &SessionTicketPool,
    ticket_request: Option<u32>,
    correlator: &Arc<RequestCorrelator>,
    method: &str,
    params: Value,
) -> Result<ResumedReply> {
    let ticket = tickets.use_ticket().await?;
    let master_secret = ticket.master_secret.clone();
    log::debug!("[Session] Resuming with ticket {} for {}", ticket.short_id(), method);

    let (hello, established) = ResumeClient::new(Arc::clone(crypto), ticket).start()?;
    let layer = RecordLayer::new(Arc::clone(crypto), Role::Client);
    install_states(&layer, &established)?;

    let mut body = layer.send_message(&hello, ContentType::Handshake, false)?;
    body.extend(layer.change_cipher_spec()?);
    if let Some(count) = ticket_request {
        body.extend(layer.send_message(
            &ClientHandshake::TicketRequest { count },
            ContentType::Handshake,
            false,
        )?);
    }
    let (frame, mut pending) = correlator.register(method, params)?;
    body.extend(layer.send_message(&frame, ContentType::ApplicationData, false)?);

    let response = endpoint.post(body).await?;
    let mut handler = ReplyHandler::new(correlator, Some((tickets, master_secret.as_slice())));
    layer.process(&response, &mut handler)?;
    let result = pending.try_take().ok_or_else(|| {
        SessionError::Protocol(format!("response carried no reply to call {}", frame.id))
    })?;
    Ok(ResumedReply {
        result,
        refilled: handler.refilled(),
    })
}

/// Send one call in the clear, for methods allowed before authentication.
pub(crate) async fn plain_call(
    endpoint: &Endpoint,
    crypto: &Arc<dyn CryptoService>,
    correlator: &Arc<RequestCorrelator>,
    method: &str,
    params: Value,
) -> Result<Value> {
    let layer = RecordLayer::new(Arc::clone(crypto), Role::Client);
    let (frame, mut pending) = correlator.register(method, params)?;
    let body = layer.send_message(&frame, ContentType::ApplicationData, true)?;

    let response = endpoint.post(body).await?;
    let mut handler = ReplyHandler::new(correlator, None);
    layer.process(&response, &mut handler)?;
    pending.try_take().ok_or_else(|| {
        SessionError::Protocol(format!("response carried no reply to call {}", frame.id))
    })?
}
