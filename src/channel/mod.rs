//! Physical transports shared by every session talking to one server.
//!
//! # Architecture
//!
//! ```text
//! ChannelRegistry (one per SessionManager)
//!     │
//!     └── ServerKey (scheme://host:port) ──▶ ServerEntry (ref-counted by ServerLease)
//!             ├── ChannelPool   - fixed slots of lazily created HttpChannels
//!             └── WsDemux       - one shared WebSocket, sub-channels by u32 id
//! ```
//!
//! The HTTP and WebSocket plumbing sits behind [`TransportFactory`], so the
//! pool and demultiplexer work the same over reqwest/tungstenite
//! ([`ReqwestTransport`]) and over in-memory fakes in tests.

// Rust guideline compliant 2026-02

pub mod pool;
pub mod registry;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ClientConfig;
use crate::constants;
use crate::error::TransportError;

pub use pool::{ChannelPool, PooledSlot};
pub use registry::{ChannelRegistry, ServerKey, ServerLease};
pub use websocket::{SubChannelHandle, WsDemux, WsSink, WsSource};

/// Content type of record bodies.
pub const RECORD_CONTENT_TYPE: &str = "application/octet-stream";

/// Connection state of a shared WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Last connection attempt or connection failed.
    Error(String),
}

/// Response of one physical HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
    /// `Keep-Alive: timeout=N` hint, if the server sent one.
    pub keep_alive: Option<Duration>,
}

impl HttpResponse {
    /// `true` only for 200.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// One physical HTTP connection.
///
/// Implementations return `Ok` for every HTTP status; callers decide which
/// statuses are errors.
#[async_trait]
pub trait HttpChannel: Send + Sync + std::fmt::Debug {
    /// POST a record body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, TransportError>;

    /// GET `url` (used for probing).
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// Creates physical channels.
#[async_trait]
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Create an HTTP channel for `server`. Must not perform network I/O.
    fn http_channel(&self, server: &ServerKey) -> Result<Arc<dyn HttpChannel>, TransportError>;

    /// Open a WebSocket to `url`.
    async fn connect_websocket(
        &self,
        url: &str,
    ) -> Result<(Box<dyn WsSink>, Box<dyn WsSource>), TransportError>;
}

/// Parse a `Keep-Alive` header value such as `timeout=5, max=100`.
pub fn parse_keep_alive(value: &str) -> Option<Duration> {
    value.split(',').find_map(|part| {
        let (key, val) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("timeout") {
            val.trim().parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

/// Map a reqwest failure onto the transport taxonomy.
fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::NoResponse(err.to_string())
    } else if err.is_connect() {
        TransportError::Network(err.to_string())
    } else if err.is_request() || err.is_body() || err.is_decode() {
        TransportError::NoResponse(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

/// HTTP channel backed by a dedicated reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestChannel {
    client: reqwest::Client,
}

impl ReqwestChannel {
    async fn finish(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let keep_alive = response
            .headers()
            .get("keep-alive")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_keep_alive);
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::NoResponse(e.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
            keep_alive,
        })
    }
}

#[async_trait]
impl HttpChannel for ReqwestChannel {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", RECORD_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Self::finish(response).await
    }

    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Self::finish(response).await
    }
}

/// Production transport: reqwest for HTTP, tokio-tungstenite for WebSocket.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
    headers: Vec<(String, String)>,
    request_timeout: Duration,
}

impl ReqwestTransport {
    /// Transport configured from `config` (user agent, extra headers, timeout).
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            request_timeout: config.request_timeout(),
        }
    }

    fn default_headers(&self) -> Result<reqwest::header::HeaderMap, TransportError> {
        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Network(format!("invalid header name {name}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::Network(format!("invalid header value: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl TransportFactory for ReqwestTransport {
    fn http_channel(&self, server: &ServerKey) -> Result<Arc<dyn HttpChannel>, TransportError> {
        // One client per slot keeps one physical connection per slot.
        let client = reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.default_headers()?)
            .connect_timeout(constants::HTTP_CONNECT_TIMEOUT)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        log::debug!("[Transport] Created HTTP channel for {}", server);
        Ok(Arc::new(ReqwestChannel { client }))
    }

    async fn connect_websocket(
        &self,
        url: &str,
    ) -> Result<(Box<dyn WsSink>, Box<dyn WsSource>), TransportError> {
        let mut headers: Vec<(&str, &str)> = vec![("User-Agent", self.user_agent.as_str())];
        headers.extend(self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let (writer, reader) = crate::ws::connect(url, &headers).await?;
        let sink: Box<dyn WsSink> = Box::new(writer);
        let source: Box<dyn WsSource> = Box::new(reader);
        Ok((sink, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keep_alive() {
        assert_eq!(parse_keep_alive("timeout=5"), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_keep_alive("max=100, timeout=15"),
            Some(Duration::from_secs(15))
        );
        assert_eq!(parse_keep_alive("Timeout = 7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_keep_alive("max=100"), None);
        assert_eq!(parse_keep_alive("timeout=abc"), None);
    }

    #[test]
    fn test_response_success_is_200_only() {
        let mut response = HttpResponse {
            status: 200,
            body: vec![],
            keep_alive: None,
        };
        assert!(response.is_success());
        response.status = 204;
        assert!(!response.is_success());
        response.status = 302;
        assert!(!response.is_success());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = ClientConfig::default();
        config
            .headers
            .insert("bad header".to_string(), "x".to_string());
        let transport = ReqwestTransport::new(&config);
        let key = ServerKey::from_url("http://localhost:3000").unwrap();
        assert!(transport.http_channel(&key).is_err());
    }
}
