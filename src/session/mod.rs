//! Session facade.
//!
//! [`SessionManager`] owns everything shared between sessions (the channel
//! registry, crypto backend, clock and root cancellation token) and hands
//! out [`Session`] handles:
//!
//! ```text
//! SessionManager
//!   ├── ChannelRegistry ── ServerLease ──▶ ChannelPool + WsDemux
//!   └── Session (Arc<SessionInner>)
//!         ├── SessionTicketPool  ◀── refill hook: re-run full handshake (weak ref)
//!         ├── RequestCorrelator  (HTTP calls)
//!         └── WsLink             (WebSocket calls, own correlator)
//! ```
//!
//! Over HTTP every call spends one ticket in a 0-RTT resume flight. Over the
//! WebSocket the session keeps one keyed sub-channel open. Protocol failures
//! and fatal alerts tear the whole session down and reject every pending
//! call with the failure.

// Rust guideline compliant 2026-02

pub mod events;
mod flight;
mod link;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelRegistry, ReqwestTransport, ServerKey, ServerLease, TransportFactory, WsDemux};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::correlator::RequestCorrelator;
use crate::crypto::{CryptoService, DefaultCryptoService};
use crate::error::{Result, SessionError};
use crate::handshake::Strategy;
use crate::tickets::{SessionTicketPool, TicketRefill};

pub use events::{EventDispatcher, EventListener, SessionEvent};

use flight::Endpoint;
use link::WsLink;

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server to talk to; the configured `server_url` when `None`.
    pub server_url: Option<String>,
    /// How to authenticate.
    pub strategy: Strategy,
}

impl SessionOptions {
    /// Options for the configured server.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            server_url: None,
            strategy,
        }
    }

    /// Talk to `url` instead of the configured server.
    pub fn with_server(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }
}

/// Which physical transport carries a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallChannel {
    /// Pooled HTTP, one ticket per call.
    #[default]
    Http,
    /// The session's sub-channel on the shared WebSocket.
    WebSocket,
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Transport for the call.
    pub channel: CallChannel,
    /// Send unkeyed over HTTP (pre-authentication methods). Ignores `channel`.
    pub force_plaintext: bool,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

/// Outcome of [`SessionManager::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    /// HTTP status returned by the server.
    pub status: u16,
    /// Time until the response arrived.
    pub latency: Duration,
}

/// Creates sessions and owns the state they share.
pub struct SessionManager {
    config: ClientConfig,
    crypto: Arc<dyn CryptoService>,
    clock: Arc<dyn Clock>,
    registry: Arc<ChannelRegistry>,
    root: CancellationToken,
    events: Arc<EventDispatcher>,
    plain: Arc<RequestCorrelator>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("server_url", &self.config.server_url)
            .field("servers", &self.registry.server_count())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Manager using reqwest/tungstenite, RustCrypto and the system clock.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let factory = Arc::new(ReqwestTransport::new(&config));
        Self::with_transport(config, factory, Arc::new(DefaultCryptoService), Arc::new(SystemClock))
    }

    /// Manager with explicit collaborators.
    pub fn with_transport(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        crypto: Arc<dyn CryptoService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SessionError::Config(format!("{e:#}")))?;
        let registry = ChannelRegistry::new(factory, config.pool_size, &config.ws_path);
        Ok(Self {
            config,
            crypto,
            clock,
            registry,
            root: CancellationToken::new(),
            events: Arc::new(EventDispatcher::default()),
            plain: RequestCorrelator::new(),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared per-server transports.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Listen for lifecycle events of every session.
    pub fn add_listener(&self, listener: EventListener) {
        self.events.add(listener);
    }

    fn resolve_server(&self, server_url: Option<&str>) -> Result<(String, ServerKey)> {
        let url = server_url
            .unwrap_or(&self.config.server_url)
            .trim_end_matches('/')
            .to_string();
        let key = ServerKey::from_url(&url)?;
        Ok((url, key))
    }

    /// Authenticate a new session with `options.strategy`.
    pub async fn create_session(&self, options: SessionOptions) -> Result<Session> {
        if self.root.is_cancelled() {
            return Err(SessionError::ConnectionClosed);
        }
        let (url, key) = self.resolve_server(options.server_url.as_deref())?;
        let lease = self.registry.acquire(&key);
        let endpoint = Endpoint {
            pool: Arc::clone(lease.pool()),
            url: format!("{}{}", url, self.config.api_path),
        };
        let id = crate::handshake::to_hex(&self.crypto.random_bytes(4));

        let tickets = Arc::new(SessionTicketPool::new(
            Arc::clone(&self.clock),
            self.config.ticket_ttl_margin(),
            self.config.ticket_horizon_threshold(),
        ));
        let cancel = self.root.child_token();
        let sweeper = tickets.spawn_sweeper(self.config.ticket_sweep_interval(), cancel.clone());

        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            id,
            server: key.to_string(),
            host: key.host.clone(),
            strategy: options.strategy,
            crypto: Arc::clone(&self.crypto),
            endpoint,
            ws: Arc::clone(lease.ws()),
            lease: Mutex::new(Some(lease)),
            tickets,
            correlator: RequestCorrelator::new(),
            plain: Arc::clone(&self.plain),
            events: Arc::clone(&self.events),
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
            ws_link: Mutex::new(None),
            ws_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            tickets_request: self.config.tickets_request_count,
            tickets_min: self.config.tickets_min_count,
            request_timeout: self.config.request_timeout(),
        });

        match &inner.strategy {
            Strategy::Resume {
                tickets,
                ttl_secs,
                master_secret,
            } => {
                inner.tickets.save_tickets(tickets, *ttl_secs, master_secret);
            }
            _ => {
                let attempt = tokio::select! {
                    () = inner.cancel.cancelled() => Err(SessionError::ConnectionClosed),
                    r = tokio::time::timeout(inner.request_timeout, inner.full_handshake()) => {
                        r.unwrap_or(Err(SessionError::Timeout))
                    }
                };
                if let Err(err) = attempt {
                    log::warn!(
                        "[Session] {} handshake with {} failed: {}",
                        inner.id,
                        inner.server,
                        err
                    );
                    inner.shutdown(&err, false);
                    return Err(err);
                }
                inner.tickets.set_refill(Arc::new(HandshakeRefill {
                    session: Arc::downgrade(&inner),
                }));
            }
        }

        log::info!(
            "[Session] {} connected to {} via {}",
            inner.id,
            inner.server,
            inner.strategy.name()
        );
        inner.events.emit(&SessionEvent::Connected {
            session: inner.id.clone(),
            server: inner.server.clone(),
            strategy: inner.strategy.name(),
        });

        let mut sessions = self.sessions.lock().expect("SessionManager mutex poisoned");
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&inner));
        Ok(Session { inner })
    }

    /// Send an unkeyed call without a session (pre-authentication methods).
    pub async fn send_plain(
        &self,
        server_url: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let (url, key) = self.resolve_server(server_url)?;
        let lease = self.registry.acquire(&key);
        let endpoint = Endpoint {
            pool: Arc::clone(lease.pool()),
            url: format!("{}{}", url, self.config.api_path),
        };
        let call = flight::plain_call(&endpoint, &self.crypto, &self.plain, method, params);
        tokio::select! {
            () = self.root.cancelled() => Err(SessionError::ConnectionClosed),
            r = tokio::time::timeout(self.config.request_timeout(), call) => {
                r.unwrap_or(Err(SessionError::Timeout))
            }
        }
    }

    /// `GET url` through a pooled channel of its server, without a session.
    pub async fn probe(&self, url: &str, timeout: Option<Duration>) -> Result<ProbeResult> {
        let key = ServerKey::from_url(url)?;
        let lease = self.registry.acquire(&key);
        let timeout = timeout.unwrap_or_else(|| self.config.probe_timeout());
        let started = Instant::now();
        let exchange = async {
            let slot = lease.pool().acquire().await?;
            slot.get(url).await
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| SessionError::Timeout)??;
        let latency = started.elapsed();
        log::debug!(
            "[Session] Probe {} -> {} in {:?}",
            url,
            response.status,
            latency
        );
        Ok(ProbeResult {
            status: response.status,
            latency,
        })
    }

    /// Disconnect every session and close all shared transports.
    pub fn shutdown(&self) {
        self.root.cancel();
        let sessions: Vec<Weak<SessionInner>> = self
            .sessions
            .lock()
            .expect("SessionManager mutex poisoned")
            .drain(..)
            .collect();
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.shutdown(&SessionError::ConnectionClosed, true);
        }
        self.plain.reject_all(&SessionError::ConnectionClosed);
        self.registry.shutdown();
        log::info!("[Session] Manager shut down");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct SessionInner {
    me: Weak<SessionInner>,
    id: String,
    server: String,
    host: String,
    strategy: Strategy,
    crypto: Arc<dyn CryptoService>,
    endpoint: Endpoint,
    ws: Arc<WsDemux>,
    lease: Mutex<Option<ServerLease>>,
    tickets: Arc<SessionTicketPool>,
    correlator: Arc<RequestCorrelator>,
    plain: Arc<RequestCorrelator>,
    events: Arc<EventDispatcher>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    ws_link: Mutex<Option<Arc<WsLink>>>,
    ws_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    tickets_request: u32,
    tickets_min: usize,
    request_timeout: Duration,
}

impl SessionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SessionError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// Run the session's strategy and store the tickets it yields.
    async fn full_handshake(&self) -> Result<()> {
        let agreement =
            self.strategy
                .key_agreement(&self.crypto, &self.host, self.tickets_request)?;
        let established = flight::full_handshake(&self.endpoint, &self.crypto, agreement).await?;
        self.tickets.save_tickets(
            &established.tickets,
            established.ttl_secs,
            &established.master_secret,
        );
        log::debug!(
            "[Session] {} {} handshake issued {} tickets",
            self.id,
            self.strategy.name(),
            established.tickets.len()
        );
        if !established.tickets.is_empty() {
            self.events.emit(&SessionEvent::TicketsRefilled {
                session: self.id.clone(),
                count: established.tickets.len(),
            });
        }
        Ok(())
    }

    fn ticket_request(&self) -> Option<u32> {
        self.tickets
            .should_ask_for_new_tickets(self.tickets_min)
            .then_some(self.tickets_request)
    }

    async fn call_http(&self, method: &str, params: Value) -> Result<Value> {
        let reply = flight::resumed_call(
            &self.endpoint,
            &self.crypto,
            &self.tickets,
            self.ticket_request(),
            &self.correlator,
            method,
            params,
        )
        .await?;
        if reply.refilled > 0 {
            self.events.emit(&SessionEvent::TicketsRefilled {
                session: self.id.clone(),
                count: reply.refilled,
            });
        }
        reply.result
    }

    async fn ws_link(&self) -> Result<Arc<WsLink>> {
        let _gate = self.ws_gate.lock().await;
        if let Some(link) = self.current_link() {
            return Ok(link);
        }
        let link = Arc::new(
            WsLink::open(
                &self.ws,
                &self.crypto,
                &self.tickets,
                self.ticket_request(),
                &self.events,
                &self.id,
                self.me.clone(),
            )
            .await?,
        );
        self.ensure_open()?;
        *self.ws_link.lock().expect("Session link mutex poisoned") = Some(Arc::clone(&link));
        log::info!("[Session] {} WebSocket link ready", self.id);
        self.events.emit(&SessionEvent::WebSocketConnected {
            session: self.id.clone(),
        });
        Ok(link)
    }

    fn current_link(&self) -> Option<Arc<WsLink>> {
        let mut slot = self.ws_link.lock().expect("Session link mutex poisoned");
        match slot.as_ref() {
            Some(link) if link.is_alive() => Some(Arc::clone(link)),
            Some(_) => {
                slot.take();
                None
            }
            None => None,
        }
    }

    async fn call_ws(&self, method: &str, params: Value) -> Result<Value> {
        self.ws_link().await?.call(method, params).await
    }

    async fn dispatch(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        if options.force_plaintext {
            return flight::plain_call(&self.endpoint, &self.crypto, &self.plain, method, params)
                .await;
        }
        match options.channel {
            CallChannel::Http => self.call_http(method, params).await,
            CallChannel::WebSocket => self.call_ws(method, params).await,
        }
    }

    /// Tear the session down. Idempotent.
    fn shutdown(&self, reason: &SessionError, notify: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.correlator.close(reason);
        let link = self
            .ws_link
            .lock()
            .expect("Session link mutex poisoned")
            .take();
        if let Some(link) = link {
            link.close(reason);
        }
        self.tickets.clear_refill();
        self.tickets.clear();
        if let Some(sweeper) = self.sweeper.lock().expect("Session sweeper mutex poisoned").take() {
            sweeper.abort();
        }
        self.lease.lock().expect("Session lease mutex poisoned").take();
        if notify {
            log::info!("[Session] {} disconnected: {}", self.id, reason);
            self.events.emit(&SessionEvent::Disconnected {
                session: self.id.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Re-runs the full handshake when the ticket pool runs dry.
struct HandshakeRefill {
    session: Weak<SessionInner>,
}

#[async_trait]
impl TicketRefill for HandshakeRefill {
    async fn refill(&self) -> Result<()> {
        let session = self
            .session
            .upgrade()
            .ok_or(SessionError::ConnectionClosed)?;
        session.ensure_open()?;
        log::info!("[Session] {} out of tickets, re-authenticating", session.id);
        session.full_handshake().await
    }
}

/// Handle to an authenticated session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("server", &self.inner.server)
            .field("strategy", &self.inner.strategy.name())
            .finish()
    }
}

impl Session {
    /// Short random id used in logs and events.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// `scheme://host:port` of the server.
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// Live tickets left for resumption.
    pub fn tickets_count(&self) -> usize {
        self.inner.tickets.tickets_count()
    }

    /// `false` after [`disconnect`](Self::disconnect) or a fatal error.
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send `method(params)` and wait for the reply.
    ///
    /// Cancelling `cancel` aborts the in-flight request and yields
    /// [`SessionError::Cancelled`]. Protocol failures and fatal alerts
    /// disconnect the session.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.inner.ensure_open()?;
        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);
        let session = self.inner.cancel.clone();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SessionError::Cancelled),
            () = session.cancelled() => Err(SessionError::ConnectionClosed),
            r = tokio::time::timeout(timeout, self.inner.dispatch(method, params, options)) => {
                r.unwrap_or(Err(SessionError::Timeout))
            }
        };
        if let Err(err) = &outcome {
            if err.is_fatal() && !matches!(err, SessionError::ConnectionClosed) {
                log::warn!("[Session] {} fatal error on {}: {}", self.inner.id, method, err);
                self.inner.shutdown(err, true);
            }
        }
        outcome
    }

    /// [`send`](Self::send) over HTTP with default options and no cancellation.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.send(method, params, CallOptions::default(), &CancellationToken::new())
            .await
    }

    /// Open the session's WebSocket sub-channel now rather than on first use.
    pub async fn connect_websocket(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.ws_link().await.map(|_| ())
    }

    /// Reject pending calls, close the sub-channel and release the server.
    pub fn disconnect(&self) {
        self.inner
            .shutdown(&SessionError::ConnectionClosed, true);
    }
}
