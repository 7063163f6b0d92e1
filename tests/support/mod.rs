//! In-process server for the integration tests.
//!
//! `SimServer` implements [`TransportFactory`]: HTTP posts and WebSocket
//! frames are fed straight into a server-role [`RecordLayer`], so every test
//! exercises the real client against a real peer without sockets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use num_bigint::BigUint;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use sessionwire::channel::{HttpChannel, HttpResponse, WsSink, WsSource};
use sessionwire::clock::SystemClock;
use sessionwire::codec;
use sessionwire::constants::CONTENT_APPLICATION_DATA;
use sessionwire::correlator::{CallFrame, ReplyFrame};
use sessionwire::crypto::{CryptoService, DefaultCryptoService};
use sessionwire::handshake::resume::ticket_server_random;
use sessionwire::handshake::srp::{compute_verifier, parse_hex_int};
use sessionwire::handshake::{
    ClientHandshake, DefaultPasswordMixer, PasswordMixer, ServerHandshake, SrpGroup, SrpServer,
};
use sessionwire::record::{get_fresh_rw_states, AlertLevel, ContentType, RecordHandler, RecordLayer, Role};
use sessionwire::{
    ClientConfig, Result, ServerKey, SessionError, SessionEvent, SessionManager, TransportError,
    TransportFactory,
};

pub const SERVER_URL: &str = "http://sim.test:8080";
pub const TICKET_TTL: u64 = 300;

/// Methods the server answers without keys.
const PLAIN_METHODS: &[&str] = &["ping", "server_info"];

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn unhex(value: &str) -> Vec<u8> {
    let value = if value.len() % 2 == 1 {
        format!("0{value}")
    } else {
        value.to_string()
    };
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).expect("hex"))
        .collect()
}

fn b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn unb64(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| SessionError::Protocol(format!("bad base64: {e}")))
}

struct Account {
    salt: Vec<u8>,
    verifier: BigUint,
    login_data: Option<Value>,
}

struct PendingSrp {
    server: SrpServer,
    client_random: Vec<u8>,
    server_random: Vec<u8>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    static_keys: HashMap<String, Vec<u8>>,
    srp_pending: HashMap<String, PendingSrp>,
    tickets: HashMap<String, Vec<u8>>,
    next_id: u64,
    calls: Vec<CallFrame>,
    full_handshakes: usize,
    ticket_requests: usize,
    tickets_per_handshake: Option<u32>,
    refuse_ticket_requests: bool,
    status_override: Option<u16>,
    post_delay: Option<Duration>,
    corrupt_replies: bool,
    ws_connects: usize,
    ws_peers: HashMap<usize, mpsc::UnboundedSender<Vec<u8>>>,
    ws_channels: Vec<(usize, u32)>,
}

struct Core {
    crypto: Arc<dyn CryptoService>,
    state: Mutex<State>,
    posts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Simulated server shared by the client's channels.
#[derive(Clone)]
pub struct SimServer {
    core: Arc<Core>,
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer").finish_non_exhaustive()
    }
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimServer {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                crypto: Arc::new(DefaultCryptoService),
                state: Mutex::new(State::default()),
                posts: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.core.state.lock().expect("SimServer mutex poisoned")
    }

    /// Register an SRP account. With `login_data` the verifier is built from
    /// the mixed password, as a server storing PBKDF2 output would.
    pub fn add_account(&self, identity: &str, password: &str, login_data: Option<Value>) {
        let crypto = Arc::clone(&self.core.crypto);
        let salt = crypto.random_bytes(16);
        let mixed = DefaultPasswordMixer::new(Arc::clone(&crypto))
            .mix(password, login_data.as_ref())
            .expect("login data");
        let verifier = compute_verifier(
            crypto.as_ref(),
            &SrpGroup::rfc5054_2048(),
            identity,
            &mixed,
            &salt,
        );
        self.state().accounts.insert(
            identity.to_string(),
            Account {
                salt,
                verifier,
                login_data,
            },
        );
    }

    pub fn add_static_key(&self, key_id: &str, key: &[u8]) {
        self.state()
            .static_keys
            .insert(key_id.to_string(), key.to_vec());
    }

    /// Issue tickets outside any handshake, for resume-only clients.
    pub fn issue_tickets(&self, count: u32, master_secret: &[u8]) -> Vec<String> {
        self.core.issue(&mut self.state(), count, master_secret)
    }

    /// Cap the tickets issued by a full handshake.
    pub fn set_tickets_per_handshake(&self, count: u32) {
        self.state().tickets_per_handshake = Some(count);
    }

    pub fn set_refuse_ticket_requests(&self, refuse: bool) {
        self.state().refuse_ticket_requests = refuse;
    }

    /// Answer every POST with `status` and an empty body.
    pub fn set_status_override(&self, status: Option<u16>) {
        self.state().status_override = status;
    }

    pub fn set_post_delay(&self, delay: Option<Duration>) {
        self.state().post_delay = delay;
    }

    /// Flip the last byte of every non-empty POST response.
    pub fn set_corrupt_replies(&self, corrupt: bool) {
        self.state().corrupt_replies = corrupt;
    }

    /// Drop every open WebSocket from the server side.
    pub fn close_websockets(&self) {
        self.state().ws_peers.clear();
    }

    /// Push an application-data record with a bad MAC to every sub-channel
    /// seen so far, unprompted.
    pub fn send_tampered_websocket_records(&self) {
        let state = self.state();
        for (connection, id) in &state.ws_channels {
            let Some(peer) = state.ws_peers.get(connection) else {
                continue;
            };
            let mut frame = id.to_be_bytes().to_vec();
            frame.push(CONTENT_APPLICATION_DATA);
            // CBOR byte string, one-byte length
            frame.extend([0x58, 48]);
            frame.extend([0xAA; 48]);
            let _ = peer.send(frame);
        }
    }

    pub fn calls(&self) -> Vec<CallFrame> {
        self.state().calls.clone()
    }

    pub fn call_methods(&self) -> Vec<String> {
        self.state().calls.iter().map(|c| c.method.clone()).collect()
    }

    pub fn full_handshakes(&self) -> usize {
        self.state().full_handshakes
    }

    pub fn ticket_requests(&self) -> usize {
        self.state().ticket_requests
    }

    pub fn outstanding_tickets(&self) -> usize {
        self.state().tickets.len()
    }

    pub fn posts(&self) -> usize {
        self.core.posts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_posts(&self) -> usize {
        self.core.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn ws_connects(&self) -> usize {
        self.state().ws_connects
    }

    /// Wait until the server has seen a call to `method`.
    pub async fn wait_for_call(&self, method: &str) {
        for _ in 0..200 {
            if self.call_methods().iter().any(|m| m == method) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server never saw a call to {method}");
    }
}

enum Outgoing {
    Handshake(ServerHandshake),
    Ccs,
    Reply(ReplyFrame),
}

/// Collects what the server sends back while processing one inbound flight.
struct Exchange<'a> {
    core: &'a Core,
    outgoing: Vec<Outgoing>,
    master_secret: Option<Vec<u8>>,
}

impl RecordHandler for Exchange<'_> {
    fn on_handshake(&mut self, layer: &RecordLayer, payload: Vec<u8>) -> Result<()> {
        let message: ClientHandshake = codec::from_slice(&payload)?;
        self.core.on_handshake(layer, message, self)
    }

    fn on_application_data(&mut self, layer: &RecordLayer, payload: Vec<u8>) -> Result<()> {
        let call: CallFrame = codec::from_slice(&payload)?;
        if let Some(reply) = self.core.on_call(call, layer.is_keyed()) {
            self.outgoing.push(Outgoing::Reply(reply));
        }
        Ok(())
    }
}

impl Core {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("SimServer mutex poisoned")
    }

    fn issue(&self, state: &mut State, count: u32, master_secret: &[u8]) -> Vec<String> {
        (0..count)
            .map(|_| {
                state.next_id += 1;
                let id = format!("tk-{}-{}", state.next_id, hex(&self.crypto.random_bytes(4)));
                state.tickets.insert(id.clone(), master_secret.to_vec());
                id
            })
            .collect()
    }

    fn random(&self) -> Vec<u8> {
        self.crypto.random_bytes(32)
    }

    /// Key the layer for a completed full handshake and queue the final
    /// message plus ChangeCipherSpec.
    fn finish(
        &self,
        layer: &RecordLayer,
        exchange: &mut Exchange<'_>,
        master_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
        requested: u32,
        reply: impl FnOnce(Vec<String>, u64) -> ServerHandshake,
    ) -> Result<()> {
        layer.set_next_states(get_fresh_rw_states(
            self.crypto.as_ref(),
            master_secret,
            client_random,
            server_random,
            Role::Server,
        )?);
        let mut state = self.state();
        let count = state
            .tickets_per_handshake
            .map_or(requested, |cap| cap.min(requested));
        let tickets = self.issue(&mut state, count, master_secret);
        state.full_handshakes += 1;
        exchange
            .outgoing
            .push(Outgoing::Handshake(reply(tickets, TICKET_TTL)));
        exchange.outgoing.push(Outgoing::Ccs);
        Ok(())
    }

    fn on_handshake(
        &self,
        layer: &RecordLayer,
        message: ClientHandshake,
        exchange: &mut Exchange<'_>,
    ) -> Result<()> {
        match message {
            ClientHandshake::SrpInit {
                identity,
                client_random,
                ..
            } => {
                let mut state = self.state();
                let (salt, verifier, login_data) = state
                    .accounts
                    .get(&identity)
                    .map(|a| (a.salt.clone(), a.verifier.clone(), a.login_data.clone()))
                    .ok_or_else(|| SessionError::Auth(format!("unknown identity {identity}")))?;
                let server = SrpServer::new(
                    Arc::clone(&self.crypto),
                    SrpGroup::rfc5054_2048(),
                    verifier,
                );
                let (b_pub, modulus, g, k) = server.challenge_hex();
                let server_random = self.random();
                state.next_id += 1;
                let session_id = format!("srp-{}", state.next_id);
                let challenge = ServerHandshake::SrpInit {
                    session_id: session_id.clone(),
                    s: hex(&salt),
                    b_pub,
                    modulus,
                    g,
                    k,
                    login_data,
                    server_random: b64(&server_random),
                };
                state.srp_pending.insert(
                    session_id,
                    PendingSrp {
                        server,
                        client_random: unb64(&client_random)?,
                        server_random,
                    },
                );
                exchange.outgoing.push(Outgoing::Handshake(challenge));
                Ok(())
            }
            ClientHandshake::SrpExchange {
                a_pub,
                m1,
                session_id,
                tickets,
            } => {
                let pending = self
                    .state()
                    .srp_pending
                    .remove(&session_id)
                    .ok_or_else(|| SessionError::Auth("unknown SRP session".into()))?;
                let a_pub = parse_hex_int("A", &a_pub)?;
                let proof = pending.server.verify_client(&a_pub, &unhex(&m1))?;
                let m2 = hex(&proof.m2);
                self.finish(
                    layer,
                    exchange,
                    &proof.key,
                    &pending.client_random,
                    &pending.server_random,
                    tickets,
                    |tickets, ttl| ServerHandshake::SrpExchange { m2, tickets, ttl },
                )
            }
            ClientHandshake::Ecdhe {
                key,
                client_random,
                tickets,
            } => {
                let pair = self.crypto.ec_generate_key()?;
                let shared = self
                    .crypto
                    .ec_shared_secret(&pair.private_key, &unb64(&key)?)?;
                let server_random = self.random();
                let encoded_random = b64(&server_random);
                let public = b64(&pair.public_key);
                self.finish(
                    layer,
                    exchange,
                    &shared,
                    &unb64(&client_random)?,
                    &server_random,
                    tickets,
                    |tickets, ttl| ServerHandshake::Ecdhe {
                        key: public,
                        server_random: encoded_random,
                        tickets,
                        ttl,
                    },
                )
            }
            ClientHandshake::Key {
                key_id,
                client_random,
                tickets,
            } => {
                let key = self
                    .state()
                    .static_keys
                    .get(&key_id)
                    .cloned()
                    .ok_or_else(|| SessionError::Auth(format!("unknown key id {key_id}")))?;
                let server_random = self.random();
                let encoded_random = b64(&server_random);
                self.finish(
                    layer,
                    exchange,
                    &key,
                    &unb64(&client_random)?,
                    &server_random,
                    tickets,
                    |tickets, ttl| ServerHandshake::Key {
                        server_random: encoded_random,
                        tickets,
                        ttl,
                    },
                )
            }
            ClientHandshake::Ticket {
                ticket,
                client_random,
            } => {
                let master_secret = self
                    .state()
                    .tickets
                    .remove(&ticket)
                    .ok_or_else(|| SessionError::Auth("unknown or spent ticket".into()))?;
                layer.set_next_states(get_fresh_rw_states(
                    self.crypto.as_ref(),
                    &master_secret,
                    &unb64(&client_random)?,
                    &ticket_server_random(&ticket),
                    Role::Server,
                )?);
                exchange.master_secret = Some(master_secret);
                Ok(())
            }
            ClientHandshake::TicketRequest { count } => {
                if !layer.is_keyed() {
                    return Err(SessionError::Protocol(
                        "ticket_request before keys were switched".into(),
                    ));
                }
                let master_secret = exchange
                    .master_secret
                    .clone()
                    .ok_or_else(|| SessionError::Protocol("no master secret".into()))?;
                let mut state = self.state();
                state.ticket_requests += 1;
                if state.refuse_ticket_requests {
                    return Ok(());
                }
                let tickets = self.issue(&mut state, count, &master_secret);
                exchange
                    .outgoing
                    .push(Outgoing::Handshake(ServerHandshake::TicketResponse {
                        tickets,
                        ttl: TICKET_TTL,
                    }));
                Ok(())
            }
        }
    }

    fn on_call(&self, call: CallFrame, keyed: bool) -> Option<ReplyFrame> {
        self.state().calls.push(call.clone());
        if !keyed && !PLAIN_METHODS.contains(&call.method.as_str()) {
            return Some(ReplyFrame::failure(call.id, 401, "authentication required"));
        }
        match call.method.as_str() {
            "ping" => Some(ReplyFrame::success(call.id, json!("pong"))),
            "echo" => Some(ReplyFrame::success(call.id, call.params)),
            "server_info" => Some(ReplyFrame::success(call.id, json!({ "version": "sim" }))),
            "fail" => Some(ReplyFrame::failure(call.id, 42, "requested failure")),
            "hang" => None,
            other => Some(ReplyFrame::failure(
                call.id,
                -32601,
                &format!("unknown method {other}"),
            )),
        }
    }

    /// Process one inbound flight on `layer` and build the response flight.
    fn respond(&self, layer: &RecordLayer, input: &[u8]) -> Vec<u8> {
        let mut exchange = Exchange {
            core: self,
            outgoing: Vec::new(),
            master_secret: None,
        };
        if let Err(err) = layer.process(input, &mut exchange) {
            return RecordLayer::new(Arc::clone(&self.crypto), Role::Server)
                .send_alert(AlertLevel::Fatal, &err.to_string())
                .expect("plaintext alert");
        }
        let mut flight = Vec::new();
        for outgoing in exchange.outgoing {
            let records = match outgoing {
                Outgoing::Handshake(message) => {
                    layer.send_message(&message, ContentType::Handshake, false)
                }
                Outgoing::Ccs => layer.change_cipher_spec(),
                Outgoing::Reply(reply) => {
                    layer.send_message(&reply, ContentType::ApplicationData, false)
                }
            };
            flight.extend(records.expect("server record"));
        }
        flight
    }
}

/// HTTP side: every POST runs on a fresh server layer.
#[derive(Debug)]
struct SimChannel {
    server: SimServer,
}

#[async_trait]
impl HttpChannel for SimChannel {
    async fn post(&self, _url: &str, body: Vec<u8>) -> std::result::Result<HttpResponse, TransportError> {
        let core = &self.server.core;
        core.posts.fetch_add(1, Ordering::SeqCst);
        let now = core.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        core.max_in_flight.fetch_max(now, Ordering::SeqCst);
        scopeguard::defer! {
            core.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let (delay, status, corrupt) = {
            let state = core.state();
            (state.post_delay, state.status_override, state.corrupt_replies)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = status {
            return Ok(HttpResponse {
                status,
                body: Vec::new(),
                keep_alive: None,
            });
        }

        let layer = RecordLayer::new(Arc::clone(&core.crypto), Role::Server);
        let mut body = core.respond(&layer, &body);
        if corrupt {
            if let Some(last) = body.last_mut() {
                *last ^= 0x01;
            }
        }
        Ok(HttpResponse {
            status: 200,
            body,
            keep_alive: None,
        })
    }

    async fn get(&self, _url: &str) -> std::result::Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: 200,
            body: b"ok".to_vec(),
            keep_alive: None,
        })
    }
}

/// WebSocket side: one server layer per sub-channel id.
struct SimWsSink {
    server: SimServer,
    connection: usize,
    layers: HashMap<u32, RecordLayer>,
}

#[async_trait]
impl WsSink for SimWsSink {
    async fn send_binary(&mut self, frame: Vec<u8>) -> std::result::Result<(), TransportError> {
        if frame.len() < 4 {
            return Err(TransportError::Network("short frame".into()));
        }
        let (prefix, records) = frame.split_at(4);
        let id = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let core = &self.server.core;
        {
            let mut state = core.state();
            if !state.ws_channels.contains(&(self.connection, id)) {
                state.ws_channels.push((self.connection, id));
            }
        }
        let layer = self
            .layers
            .entry(id)
            .or_insert_with(|| RecordLayer::new(Arc::clone(&core.crypto), Role::Server));
        let response = core.respond(layer, records);
        if response.is_empty() {
            return Ok(());
        }
        let peer = core.state().ws_peers.get(&self.connection).cloned();
        let peer = peer.ok_or_else(|| TransportError::Network("connection closed".into()))?;
        let mut out = prefix.to_vec();
        out.extend(response);
        peer.send(out)
            .map_err(|_| TransportError::Network("connection closed".into()))
    }

    async fn close(&mut self) {
        self.server.state().ws_peers.remove(&self.connection);
    }
}

struct SimWsSource {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl WsSource for SimWsSource {
    async fn recv(&mut self) -> Option<std::result::Result<Vec<u8>, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

#[async_trait]
impl TransportFactory for SimServer {
    fn http_channel(
        &self,
        _server: &ServerKey,
    ) -> std::result::Result<Arc<dyn HttpChannel>, TransportError> {
        Ok(Arc::new(SimChannel {
            server: self.clone(),
        }))
    }

    async fn connect_websocket(
        &self,
        _url: &str,
    ) -> std::result::Result<(Box<dyn WsSink>, Box<dyn WsSource>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = {
            let mut state = self.state();
            state.ws_connects += 1;
            let connection = state.ws_connects;
            state.ws_peers.insert(connection, tx);
            connection
        };
        Ok((
            Box::new(SimWsSink {
                server: self.clone(),
                connection,
                layers: HashMap::new(),
            }),
            Box::new(SimWsSource { inbound: rx }),
        ))
    }
}

pub fn config(pool_size: usize) -> ClientConfig {
    ClientConfig {
        server_url: SERVER_URL.to_string(),
        pool_size,
        ..ClientConfig::default()
    }
}

pub fn manager(server: &SimServer) -> SessionManager {
    manager_with(server, config(4))
}

pub fn manager_with(server: &SimServer, config: ClientConfig) -> SessionManager {
    SessionManager::with_transport(
        config,
        Arc::new(server.clone()),
        Arc::new(DefaultCryptoService),
        Arc::new(SystemClock),
    )
    .expect("valid config")
}

/// Capture every event the manager emits.
pub fn record_events(manager: &SessionManager) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.add_listener(Arc::new(move |event: &SessionEvent| {
        sink.lock().expect("events mutex poisoned").push(event.clone());
        Ok(())
    }));
    events
}
