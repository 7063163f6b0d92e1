//! A session's keyed sub-channel on the server's shared WebSocket.
//!
//! The link is opened with a 0-RTT resume flight and stays keyed for its
//! lifetime. Replies arrive on the demultiplexer's consumer task and resolve
//! the link's own correlator, so a WebSocket failure only rejects calls that
//! went over the WebSocket. A record that fails to decrypt or verify on the
//! link is fatal for the whole session.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use super::events::{EventDispatcher, SessionEvent};
use super::flight::ReplyHandler;
use super::SessionInner;
use crate::channel::websocket::{CloseCallback, FrameCallback};
use crate::channel::{SubChannelHandle, WsDemux};
use crate::correlator::RequestCorrelator;
use crate::crypto::CryptoService;
use crate::error::{Result, SessionError};
use crate::handshake::{install_states, ClientHandshake, ResumeClient};
use crate::record::{ContentType, RecordLayer, Role};
use crate::tickets::SessionTicketPool;

pub(crate) struct WsLink {
    handle: SubChannelHandle,
    layer: Arc<RecordLayer>,
    correlator: Arc<RequestCorrelator>,
    send_lock: Mutex<()>,
}

impl std::fmt::Debug for WsLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsLink")
            .field("channel", &self.handle.id())
            .field("phase", &self.layer.phase())
            .finish()
    }
}

impl WsLink {
    /// Register a sub-channel and send the resume flight on it.
    pub(crate) async fn open(
        demux: &Arc<WsDemux>,
        crypto: &Arc<dyn CryptoService>,
        tickets: &Arc<SessionTicketPool>,
        ticket_request: Option<u32>,
        events: &Arc<EventDispatcher>,
        session_id: &str,
        owner: Weak<SessionInner>,
    ) -> Result<Self> {
        let ticket = tickets.use_ticket().await?;
        let master_secret = Arc::new(ticket.master_secret.clone());
        log::debug!(
            "[Session] {} opening WebSocket link with ticket {}",
            session_id,
            ticket.short_id()
        );
        let (hello, established) = ResumeClient::new(Arc::clone(crypto), ticket).start()?;

        let layer = Arc::new(RecordLayer::new(Arc::clone(crypto), Role::Client));
        install_states(&layer, &established)?;
        let correlator = RequestCorrelator::new();

        let on_frame: FrameCallback = {
            let layer = Arc::clone(&layer);
            let correlator = Arc::clone(&correlator);
            let tickets = Arc::clone(tickets);
            let events = Arc::clone(events);
            let session = session_id.to_string();
            Arc::new(move |records: Vec<u8>| {
                let mut handler =
                    ReplyHandler::new(&correlator, Some((&tickets, master_secret.as_slice())));
                let outcome = layer.process(&records, &mut handler);
                if handler.refilled() > 0 {
                    events.emit(&SessionEvent::TicketsRefilled {
                        session: session.clone(),
                        count: handler.refilled(),
                    });
                }
                if let Err(err) = &outcome {
                    log::warn!("[Session] {} WebSocket link failed: {}", session, err);
                    correlator.close(err);
                    if err.is_fatal() {
                        if let Some(owner) = owner.upgrade() {
                            owner.shutdown(err, true);
                        }
                    }
                }
                outcome
            })
        };

        let on_close: CloseCallback = {
            let layer = Arc::clone(&layer);
            let correlator = Arc::clone(&correlator);
            let events = Arc::clone(events);
            let session = session_id.to_string();
            Arc::new(move |err: &SessionError| {
                layer.fail(err.clone());
                correlator.close(err);
                events.emit(&SessionEvent::WebSocketClosed {
                    session: session.clone(),
                });
                Ok(())
            })
        };

        let handle = demux.register(on_frame, on_close).await?;

        let mut flight = layer.send_message(&hello, ContentType::Handshake, false)?;
        flight.extend(layer.change_cipher_spec()?);
        if let Some(count) = ticket_request {
            flight.extend(layer.send_message(
                &ClientHandshake::TicketRequest { count },
                ContentType::Handshake,
                false,
            )?);
        }
        handle.send(&flight)?;

        Ok(Self {
            handle,
            layer,
            correlator,
            send_lock: Mutex::new(()),
        })
    }

    /// `false` once the socket or the link's record layer failed.
    pub(crate) fn is_alive(&self) -> bool {
        !self.correlator.is_closed()
    }

    /// Send one call and wait for its reply.
    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (frame, pending) = self.correlator.register(method, params)?;
        {
            // Sequence numbers must reach the socket in the order they were assigned.
            let _guard = self.send_lock.lock().expect("WsLink send mutex poisoned");
            let record = self
                .layer
                .send_message(&frame, ContentType::ApplicationData, false)?;
            self.handle.send(&record)?;
        }
        pending.wait().await
    }

    /// Reject pending calls and unregister the sub-channel.
    pub(crate) fn close(&self, err: &SessionError) {
        self.correlator.close(err);
        self.handle.close();
    }
}
