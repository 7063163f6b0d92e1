//! Shared WebSocket demultiplexer.
//!
//! One physical WebSocket per server carries many logical sub-channels.
//! Every binary frame is `[channel_id: u32 BE][records]`.
//!
//! # Tasks
//!
//! ```text
//! WsSource ──▶ reader task ──▶ inbound queue ──▶ consumer task ──▶ sub-channel callbacks
//! SubChannelHandle::send ──▶ outgoing queue ──▶ writer task ──▶ WsSink
//! ```
//!
//! Callbacks run on the consumer task, never on the reader, so a callback
//! that sends (which only enqueues) cannot deadlock the socket. The
//! connection is opened lazily by the first [`WsDemux::register`] and closed
//! when the last sub-channel unregisters, which also fires the all-closed
//! listeners.

// Rust guideline compliant 2026-01

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, TransportFactory};
use crate::constants::WS_CHANNEL_ID_SIZE;
use crate::error::{Result, SessionError, TransportError};

/// Write half of a physical WebSocket.
#[async_trait]
pub trait WsSink: Send {
    /// Send one binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> std::result::Result<(), TransportError>;

    /// Close the socket.
    async fn close(&mut self);
}

/// Read half of a physical WebSocket.
#[async_trait]
pub trait WsSource: Send {
    /// Next binary frame; `None` once the socket is closed.
    async fn recv(&mut self) -> Option<std::result::Result<Vec<u8>, TransportError>>;
}

/// Receives the records addressed to one sub-channel.
pub type FrameCallback = Arc<dyn Fn(Vec<u8>) -> Result<()> + Send + Sync>;

/// Told why a sub-channel was closed underneath it.
pub type CloseCallback = Arc<dyn Fn(&SessionError) -> Result<()> + Send + Sync>;

/// Fired when the last sub-channel goes away.
pub type AllClosedCallback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

struct SubChannel {
    on_frame: FrameCallback,
    on_close: CloseCallback,
}

struct Connection {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    generation: u64,
}

enum Inbound {
    Frame(Vec<u8>),
    Closed(String),
}

#[derive(Default)]
struct DemuxState {
    status: ConnectionState,
    connection: Option<Connection>,
    channels: HashMap<u32, SubChannel>,
    next_id: u32,
    generation: u64,
}

impl DemuxState {
    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.channels.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Drop the connection and hand back every sub-channel.
    fn teardown(&mut self) -> Vec<SubChannel> {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
        }
        self.status = ConnectionState::Disconnected;
        self.channels.drain().map(|(_, c)| c).collect()
    }
}

/// Demultiplexes one shared WebSocket into logical sub-channels.
pub struct WsDemux {
    url: String,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<DemuxState>,
    connect_gate: tokio::sync::Mutex<()>,
    all_closed: Mutex<Vec<AllClosedCallback>>,
}

impl std::fmt::Debug for WsDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WsDemux")
            .field("url", &self.url)
            .field("status", &state.status)
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl WsDemux {
    /// Demultiplexer for `url`. Does not connect yet.
    pub fn new(url: String, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new(Self {
            url,
            factory,
            state: Mutex::new(DemuxState::default()),
            connect_gate: tokio::sync::Mutex::new(()),
            all_closed: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DemuxState> {
        self.state.lock().expect("WsDemux mutex poisoned")
    }

    /// WebSocket URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.lock().status.clone()
    }

    /// Number of registered sub-channels.
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Listen for the last sub-channel going away.
    pub fn on_all_closed(&self, callback: AllClosedCallback) {
        self.all_closed
            .lock()
            .expect("WsDemux listener mutex poisoned")
            .push(callback);
    }

    fn fire_all_closed(&self) {
        let listeners = self
            .all_closed
            .lock()
            .expect("WsDemux listener mutex poisoned")
            .clone();
        for listener in listeners {
            if let Err(e) = listener() {
                log::warn!("[WsDemux] All-closed listener failed: {}", e);
            }
        }
    }

    /// Register a sub-channel, connecting the shared socket if needed.
    pub async fn register(
        self: &Arc<Self>,
        on_frame: FrameCallback,
        on_close: CloseCallback,
    ) -> Result<SubChannelHandle> {
        self.ensure_connected().await?;
        let mut state = self.lock();
        if state.connection.is_none() {
            return Err(SessionError::ConnectionClosed);
        }
        let id = state.allocate_id();
        state.channels.insert(id, SubChannel { on_frame, on_close });
        log::debug!("[WsDemux] Registered sub-channel {} on {}", id, self.url);
        Ok(SubChannelHandle {
            demux: Arc::clone(self),
            id,
            released: AtomicBool::new(false),
        })
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.lock().connection.is_some() {
            return Ok(());
        }

        self.lock().status = ConnectionState::Connecting;
        log::info!("[WsDemux] Connecting to {}", self.url);
        let (sink, source) = match self.factory.connect_websocket(&self.url).await {
            Ok(halves) => halves,
            Err(e) => {
                log::warn!("[WsDemux] Connect to {} failed: {}", self.url, e);
                self.lock().status = ConnectionState::Error(e.to_string());
                return Err(e.into());
            }
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.status = ConnectionState::Connected;
            state.connection = Some(Connection {
                outgoing: out_tx,
                cancel: cancel.clone(),
                generation: state.generation,
            });
            state.generation
        };

        tokio::spawn(run_writer(sink, out_rx, cancel.clone()));
        tokio::spawn(run_reader(source, in_tx, cancel));
        tokio::spawn(run_consumer(Arc::downgrade(self), in_rx, generation));
        log::info!("[WsDemux] Connected to {}", self.url);
        Ok(())
    }

    /// Queue `records` for sub-channel `id`.
    pub fn send(&self, id: u32, records: &[u8]) -> Result<()> {
        let state = self.lock();
        if !state.channels.contains_key(&id) {
            return Err(SessionError::ConnectionClosed);
        }
        let connection = state
            .connection
            .as_ref()
            .ok_or(SessionError::ConnectionClosed)?;
        let mut frame = Vec::with_capacity(WS_CHANNEL_ID_SIZE + records.len());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(records);
        connection
            .outgoing
            .send(frame)
            .map_err(|_| SessionError::ConnectionClosed)
    }

    /// Remove sub-channel `id`. Removing the last one closes the socket.
    pub fn unregister(&self, id: u32) {
        let last = {
            let mut state = self.lock();
            if state.channels.remove(&id).is_none() {
                return;
            }
            log::debug!("[WsDemux] Unregistered sub-channel {}", id);
            if state.channels.is_empty() {
                state.teardown();
                true
            } else {
                false
            }
        };
        if last {
            log::info!("[WsDemux] All sub-channels closed on {}", self.url);
            self.fire_all_closed();
        }
    }

    /// Close the socket, notifying every sub-channel.
    pub fn close(&self) {
        let channels = self.lock().teardown();
        self.notify_closed(channels, &SessionError::ConnectionClosed);
    }

    fn notify_closed(&self, channels: Vec<SubChannel>, reason: &SessionError) {
        if channels.is_empty() {
            return;
        }
        for channel in &channels {
            if let Err(e) = (channel.on_close)(reason) {
                log::warn!("[WsDemux] Close handler failed: {}", e);
            }
        }
        self.fire_all_closed();
    }

    fn dispatch(&self, frame: &[u8]) {
        if frame.len() < WS_CHANNEL_ID_SIZE {
            log::warn!("[WsDemux] Dropping short frame ({} bytes)", frame.len());
            return;
        }
        let (prefix, records) = frame.split_at(WS_CHANNEL_ID_SIZE);
        let id = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let callback = self
            .lock()
            .channels
            .get(&id)
            .map(|c| Arc::clone(&c.on_frame));
        match callback {
            Some(callback) => {
                if let Err(e) = callback(records.to_vec()) {
                    log::warn!("[WsDemux] Sub-channel {} rejected frame: {}", id, e);
                }
            }
            None => log::debug!("[WsDemux] Frame for unknown sub-channel {}", id),
        }
    }

    fn handle_closed(&self, generation: u64, reason: &str) {
        let channels = {
            let mut state = self.lock();
            if state.connection.as_ref().map(|c| c.generation) != Some(generation) {
                return;
            }
            log::info!("[WsDemux] Connection to {} closed: {}", self.url, reason);
            state.teardown()
        };
        self.notify_closed(channels, &SessionError::ConnectionClosed);
    }
}

async fn run_writer(
    mut sink: Box<dyn WsSink>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = outgoing.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send_binary(frame).await {
                    log::warn!("[WsDemux] Send failed: {}", e);
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    sink.close().await;
}

async fn run_reader(
    mut source: Box<dyn WsSource>,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => break "closed locally".to_string(),
            frame = source.recv() => match frame {
                Some(Ok(data)) => {
                    if inbound.send(Inbound::Frame(data)).is_err() {
                        break "consumer gone".to_string();
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "closed by server".to_string(),
            }
        }
    };
    let _ = inbound.send(Inbound::Closed(reason));
}

async fn run_consumer(
    demux: Weak<WsDemux>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    generation: u64,
) {
    while let Some(message) = inbound.recv().await {
        let Some(demux) = demux.upgrade() else { break };
        match message {
            Inbound::Frame(frame) => demux.dispatch(&frame),
            Inbound::Closed(reason) => {
                demux.handle_closed(generation, &reason);
                break;
            }
        }
    }
}

/// A registered sub-channel. Dropping it unregisters.
pub struct SubChannelHandle {
    demux: Arc<WsDemux>,
    id: u32,
    released: AtomicBool,
}

impl std::fmt::Debug for SubChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubChannelHandle").field("id", &self.id).finish()
    }
}

impl SubChannelHandle {
    /// Logical channel id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue records on this sub-channel.
    pub fn send(&self, records: &[u8]) -> Result<()> {
        self.demux.send(self.id, records)
    }

    /// Unregister now rather than on drop.
    pub fn close(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.demux.unregister(self.id);
        }
    }
}

impl Drop for SubChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}
