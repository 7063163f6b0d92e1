//! Per-server registry of channel pools and shared WebSockets.
//!
//! Sessions talking to the same `scheme://host:port` share one
//! [`ChannelPool`] and one [`WsDemux`]. Each session holds a [`ServerLease`];
//! dropping the last lease for a server removes the entry and closes its
//! WebSocket. The registry is owned by the session manager and passed
//! explicitly; nothing here is process-global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::{ChannelPool, TransportFactory, WsDemux};
use crate::error::{Result, SessionError};

/// Identity of a remote server: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    /// `http` or `https`.
    pub scheme: String,
    /// Host name or address.
    pub host: String,
    /// Port (explicit or scheme default).
    pub port: u16,
}

impl ServerKey {
    /// Parse the server part of an `http(s)` or `ws(s)` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| SessionError::Config(format!("invalid server URL {url}: {e}")))?;
        let scheme = match parsed.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => {
                return Err(SessionError::Config(format!(
                    "unsupported URL scheme: {other}"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| SessionError::Config(format!("URL has no host: {url}")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| SessionError::Config(format!("URL has no port: {url}")))?;
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// `scheme://host:port` without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// WebSocket base URL (`ws://` or `wss://`).
    pub fn ws_base_url(&self) -> String {
        let scheme = if self.scheme == "https" { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug)]
struct ServerEntry {
    pool: Arc<ChannelPool>,
    ws: Arc<WsDemux>,
    refs: usize,
}

/// Reference-counted map of server key to shared transports.
#[derive(Debug)]
pub struct ChannelRegistry {
    factory: Arc<dyn TransportFactory>,
    pool_size: usize,
    ws_path: String,
    entries: Mutex<HashMap<ServerKey, ServerEntry>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new(factory: Arc<dyn TransportFactory>, pool_size: usize, ws_path: &str) -> Arc<Self> {
        Arc::new(Self {
            factory,
            pool_size,
            ws_path: ws_path.to_string(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ServerKey, ServerEntry>> {
        self.entries.lock().expect("ChannelRegistry mutex poisoned")
    }

    /// Take a reference on the transports for `key`, creating them if needed.
    pub fn acquire(self: &Arc<Self>, key: &ServerKey) -> ServerLease {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            log::info!("[Registry] Creating transports for {}", key);
            ServerEntry {
                pool: Arc::new(ChannelPool::new(
                    key.clone(),
                    Arc::clone(&self.factory),
                    self.pool_size,
                )),
                ws: WsDemux::new(
                    format!("{}{}", key.ws_base_url(), self.ws_path),
                    Arc::clone(&self.factory),
                ),
                refs: 0,
            }
        });
        entry.refs += 1;
        ServerLease {
            registry: Arc::clone(self),
            key: key.clone(),
            pool: Arc::clone(&entry.pool),
            ws: Arc::clone(&entry.ws),
        }
    }

    fn release(&self, key: &ServerKey) {
        let removed = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            entries.remove(key)
        };
        if let Some(entry) = removed {
            log::info!("[Registry] Last lease released, tearing down {}", key);
            entry.ws.close();
        }
    }

    /// Number of servers with live leases.
    pub fn server_count(&self) -> usize {
        self.lock().len()
    }

    /// Reference count for `key` (0 if absent).
    pub fn lease_count(&self, key: &ServerKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.refs)
    }

    /// Close every shared WebSocket and forget all servers.
    ///
    /// Outstanding leases stay valid but no longer share with new ones.
    pub fn shutdown(&self) {
        let drained: Vec<ServerEntry> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.ws.close();
        }
    }
}

/// A counted reference to one server's transports.
#[derive(Debug)]
pub struct ServerLease {
    registry: Arc<ChannelRegistry>,
    key: ServerKey,
    pool: Arc<ChannelPool>,
    ws: Arc<WsDemux>,
}

impl ServerLease {
    /// Server key.
    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    /// Shared HTTP pool.
    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Shared WebSocket demultiplexer.
    pub fn ws(&self) -> &Arc<WsDemux> {
        &self.ws
    }
}

impl Clone for ServerLease {
    fn clone(&self) -> Self {
        self.registry.acquire(&self.key)
    }
}

impl Drop for ServerLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
