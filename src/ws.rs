//! tokio-tungstenite binding for the WebSocket demultiplexer.
//!
//! Sub-channel frames are always binary. [`WsReader`] hides everything else
//! (text, ping/pong, raw frames) and turns a close frame into end-of-stream,
//! so [`crate::channel::websocket`] only ever sees [`WsSink`] and [`WsSource`].
//!
//! Rust guideline compliant 2026-02

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};

use crate::channel::{WsSink, WsSource};
use crate::error::TransportError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn network(context: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::Network(format!("{context}: {err}"))
}

/// Open a WebSocket to `url`, adding `headers` to the upgrade request.
pub async fn connect(
    url: &str,
    headers: &[(&str, &str)],
) -> Result<(WsWriter, WsReader), TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| network(&format!("invalid WebSocket URL {url}"), e))?;
    for &(name, value) in headers {
        let name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| network(&format!("invalid header name {name}"), e))?;
        let value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|e| network(&format!("invalid value for header {name}"), e))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| network("WebSocket connect failed", e))?;
    log::debug!("[ws] Upgraded {} ({})", url, response.status());

    let (sink, stream) = stream.split();
    Ok((
        WsWriter { sink, closed: false },
        WsReader { stream },
    ))
}

/// Outbound half.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl WsSink for WsWriter {
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Network("WebSocket already closed".into()));
        }
        self.sink
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| network("WebSocket send failed", e))
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        // The peer may already be gone; a failed close frame is not an error.
        if let Err(e) = self.sink.send(Message::Close(None)).await {
            log::debug!("[ws] Close frame not sent: {}", e);
        }
        let _ = self.sink.close().await;
    }
}

/// Inbound half.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl WsSource for WsReader {
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data.to_vec())),
                Ok(Message::Text(text)) => {
                    log::debug!("[ws] Ignoring text frame ({} bytes)", text.len());
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(frame) => log::info!(
                            "[ws] Server closed connection: {} {}",
                            u16::from(frame.code),
                            frame.reason
                        ),
                        None => log::info!("[ws] Server closed connection"),
                    }
                    return None;
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(network("WebSocket read failed", e))),
            }
        }
    }
}
