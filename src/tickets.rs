//! Session-ticket pool.
//!
//! Tickets are single-use resumption credentials issued by the server. The
//! pool keeps them ordered by expiry so [`SessionTicketPool::use_ticket`]
//! always hands out the oldest ticket that is still safe to present.
//!
//! ```text
//! save_tickets ──▶ BTreeMap<(expires_at, seq), ticket> ──▶ use_ticket (pop first live)
//!                                │
//!                   sweeper ─────┘ (drop entries with expires_at <= now)
//! ```
//!
//! When the pool runs dry, `use_ticket` awaits the registered
//! [`TicketRefill`] hook once (callers are serialized so only one refill
//! runs at a time) and fails with [`SessionError::NoTickets`] if no hook is
//! registered or the refill produced nothing.

// Rust guideline compliant 2026-01

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::error::{Result, SessionError};
use crate::handshake::MasterSecret;

/// One resumable-session credential.
pub struct SessionTicket {
    /// Opaque server-issued id.
    pub id: String,
    /// Master secret of the handshake that issued the ticket.
    pub master_secret: MasterSecret,
    /// Expiry in clock milliseconds (margin already applied).
    pub expires_at: u64,
}

impl std::fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTicket")
            .field("id", &self.short_id())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl SessionTicket {
    /// First eight characters of the id, for logs.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Obtains more tickets when the pool is empty.
///
/// Implementations save what they obtain through
/// [`SessionTicketPool::save_tickets`] before returning.
#[async_trait]
pub trait TicketRefill: Send + Sync {
    /// Fetch and store new tickets.
    async fn refill(&self) -> Result<()>;
}

#[derive(Default)]
struct PoolState {
    entries: BTreeMap<(u64, u64), SessionTicket>,
    next_seq: u64,
    horizon: u64,
}

impl PoolState {
    fn purge(&mut self, now: u64) -> usize {
        let live = self.entries.split_off(&(now.saturating_add(1), 0));
        let expired = std::mem::replace(&mut self.entries, live);
        expired.len()
    }
}

/// Expiry-ordered pool of session tickets.
pub struct SessionTicketPool {
    clock: Arc<dyn Clock>,
    ttl_margin: Duration,
    horizon_threshold: Duration,
    state: Mutex<PoolState>,
    refill: Mutex<Option<Arc<dyn TicketRefill>>>,
    refill_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SessionTicketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionTicketPool")
            .field("tickets", &state.entries.len())
            .field("horizon", &state.horizon)
            .finish_non_exhaustive()
    }
}

impl SessionTicketPool {
    /// Create an empty pool.
    pub fn new(clock: Arc<dyn Clock>, ttl_margin: Duration, horizon_threshold: Duration) -> Self {
        Self {
            clock,
            ttl_margin,
            horizon_threshold,
            state: Mutex::new(PoolState::default()),
            refill: Mutex::new(None),
            refill_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("SessionTicketPool mutex poisoned")
    }

    /// Register (or replace) the zero-tickets hook.
    pub fn set_refill(&self, hook: Arc<dyn TicketRefill>) {
        *self.refill.lock().expect("SessionTicketPool refill mutex poisoned") = Some(hook);
    }

    /// Remove the zero-tickets hook.
    pub fn clear_refill(&self) {
        *self.refill.lock().expect("SessionTicketPool refill mutex poisoned") = None;
    }

    /// Store tickets issued under `master_secret`, valid for `ttl_secs`.
    ///
    /// Each ticket expires at `now + ttl - margin`; tickets whose lifetime
    /// does not exceed the margin are dropped.
    pub fn save_tickets(&self, ids: &[String], ttl_secs: u64, master_secret: &[u8]) {
        let now = self.clock.now_ms();
        let expires_at = now
            .saturating_add(ttl_secs.saturating_mul(1000))
            .saturating_sub(self.ttl_margin.as_millis() as u64);
        if expires_at <= now {
            log::warn!(
                "[Tickets] Dropping {} tickets: ttl {}s within safety margin",
                ids.len(),
                ttl_secs
            );
            return;
        }

        let mut state = self.lock();
        for id in ids {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                (expires_at, seq),
                SessionTicket {
                    id: id.clone(),
                    master_secret: Zeroizing::new(master_secret.to_vec()),
                    expires_at,
                },
            );
        }
        state.horizon = state.horizon.max(expires_at);
        log::debug!(
            "[Tickets] Stored {} tickets (pool now {})",
            ids.len(),
            state.entries.len()
        );
    }

    /// Pop the earliest-expiring live ticket, if any.
    fn pop_live(&self) -> Option<SessionTicket> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let purged = state.purge(now);
        if purged > 0 {
            log::debug!("[Tickets] Purged {} expired tickets", purged);
        }
        state.entries.pop_first().map(|(_, ticket)| ticket)
    }

    /// Take the oldest unexpired ticket, refilling once if the pool is empty.
    pub async fn use_ticket(&self) -> Result<SessionTicket> {
        if let Some(ticket) = self.pop_live() {
            return Ok(ticket);
        }

        let _gate = self.refill_gate.lock().await;
        // Another caller may have refilled while we waited for the gate.
        if let Some(ticket) = self.pop_live() {
            return Ok(ticket);
        }

        let hook = self
            .refill
            .lock()
            .expect("SessionTicketPool refill mutex poisoned")
            .clone();
        let Some(hook) = hook else {
            return Err(SessionError::NoTickets);
        };

        log::info!("[Tickets] Pool empty, requesting new tickets");
        hook.refill().await?;
        self.pop_live().ok_or(SessionError::NoTickets)
    }

    /// Whether the caller should proactively ask the server for tickets.
    ///
    /// True when fewer than `min_count` live tickets remain, or when the
    /// newest known expiry falls within the horizon threshold.
    pub fn should_ask_for_new_tickets(&self, min_count: usize) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.purge(now);
        state.entries.len() < min_count
            || state.horizon <= now.saturating_add(self.horizon_threshold.as_millis() as u64)
    }

    /// Number of live tickets.
    pub fn tickets_count(&self) -> usize {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.purge(now);
        state.entries.len()
    }

    /// Drop expired tickets, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock().purge(now)
    }

    /// Drop every ticket.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.horizon = 0;
    }

    /// Spawn the background sweep. The task holds only a weak reference and
    /// stops when the pool is dropped or `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let purged = pool.purge_expired();
                        if purged > 0 {
                            log::debug!("[Tickets] Sweeper dropped {} expired tickets", purged);
                        }
                    }
                }
            }
            log::debug!("[Tickets] Sweeper stopped");
        })
    }
}
