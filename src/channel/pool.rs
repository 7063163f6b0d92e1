//! Bounded pool of physical HTTP channels for one server.
//!
//! A fixed number of slots, each `free` or `busy`, each lazily holding a
//! physical [`HttpChannel`]. [`ChannelPool::acquire`] takes a free slot or
//! waits to be woken by a release; a woken waiter retries exactly once and
//! fails with [`SessionError::ChannelAcquisition`] if the slot was taken in
//! the meantime. Releases wake one waiter at a time, and never more waiters
//! than are registered, so no wake-up outlives the waiter it was meant for.
//!
//! Slots are released by dropping the [`PooledSlot`] guard. A guard dropped
//! while its request is still in flight (cancelled call) discards the
//! physical channel so the next user starts on a fresh connection.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::{HttpChannel, HttpResponse, ServerKey, TransportFactory};
use crate::error::{Result, SessionError, TransportError};

#[derive(Debug, Default)]
struct Slot {
    channel: Option<Arc<dyn HttpChannel>>,
    busy: bool,
    stale_at: Option<Instant>,
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    waiters: usize,
    /// Wake-ups handed out by releases and not yet claimed by a waiter.
    wakes: usize,
}

/// Fixed-size slot table of HTTP channels.
#[derive(Debug)]
pub struct ChannelPool {
    server: ServerKey,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl ChannelPool {
    /// Create a pool with `size` slots. Channels are created on first use.
    pub fn new(server: ServerKey, factory: Arc<dyn TransportFactory>, size: usize) -> Self {
        Self {
            server,
            factory,
            state: Mutex::new(PoolState {
                slots: (0..size.max(1)).map(|_| Slot::default()).collect(),
                waiters: 0,
                wakes: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("ChannelPool mutex poisoned")
    }

    /// Server this pool talks to.
    pub fn server(&self) -> &ServerKey {
        &self.server
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of busy slots.
    pub fn busy_count(&self) -> usize {
        self.lock().slots.iter().filter(|s| s.busy).count()
    }

    /// Number of callers waiting for a slot.
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters
    }

    /// Take a free slot under the lock, creating its channel if needed.
    fn try_take(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) -> std::result::Result<Option<PooledSlot>, TransportError> {
        let Some(index) = state.slots.iter().position(|s| !s.busy) else {
            return Ok(None);
        };
        let slot = &mut state.slots[index];
        if slot.stale_at.is_some_and(|at| at <= Instant::now()) {
            log::debug!("[Pool] Slot {} on {} past keep-alive, recreating", index, self.server);
            slot.channel = None;
            slot.stale_at = None;
        }
        let channel = match &slot.channel {
            Some(channel) => Arc::clone(channel),
            None => {
                let channel = self.factory.http_channel(&self.server)?;
                slot.channel = Some(Arc::clone(&channel));
                channel
            }
        };
        slot.busy = true;
        Ok(Some(PooledSlot {
            pool: Arc::clone(self),
            index,
            channel,
            in_flight: AtomicBool::new(false),
        }))
    }

    /// Acquire a slot, waiting for a release if all are busy.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSlot> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.lock();
                if let Some(slot) = self.try_take(&mut state)? {
                    return Ok(slot);
                }
                state.waiters += 1;
                // Enqueued under the lock so a release right after unlocking
                // is delivered to this waiter.
                notified.as_mut().enable();
            }

            let waiting = scopeguard::guard((), |()| {
                let mut state = self.lock();
                state.waiters -= 1;
                state.wakes = state.wakes.min(state.waiters);
            });
            log::debug!("[Pool] All {} slots busy on {}, waiting", self.capacity(), self.server);
            notified.await;
            scopeguard::ScopeGuard::into_inner(waiting);

            let mut state = self.lock();
            state.waiters -= 1;
            if state.wakes == 0 {
                // Leftover permit from a cancelled waiter, not a release.
                continue;
            }
            state.wakes -= 1;
            return self
                .try_take(&mut state)?
                .ok_or(SessionError::ChannelAcquisition);
        }
    }

    fn release(&self, index: usize, discard: bool) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.busy = false;
            if discard {
                slot.channel = None;
                slot.stale_at = None;
            }
        }
        if state.waiters > state.wakes {
            state.wakes += 1;
            self.notify.notify_one();
        }
    }

    fn note_keep_alive(&self, index: usize, keep_alive: Duration) {
        if let Some(slot) = self.lock().slots.get_mut(index) {
            slot.stale_at = Some(Instant::now() + keep_alive);
        }
    }
}

/// A busy slot. Dropping it releases the slot and wakes one waiter.
#[derive(Debug)]
pub struct PooledSlot {
    pool: Arc<ChannelPool>,
    index: usize,
    channel: Arc<dyn HttpChannel>,
    in_flight: AtomicBool,
}

impl PooledSlot {
    /// Slot index within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Physical channel of this slot.
    pub fn channel(&self) -> &Arc<dyn HttpChannel> {
        &self.channel
    }

    /// POST `body`; non-200 responses become [`TransportError::InvalidStatus`].
    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse> {
        self.in_flight.store(true, Ordering::SeqCst);
        let response = self.channel.post(url, body).await;
        self.in_flight.store(false, Ordering::SeqCst);
        let response = response?;
        self.observe(&response);
        if !response.is_success() {
            return Err(TransportError::InvalidStatus {
                status: response.status,
            }
            .into());
        }
        Ok(response)
    }

    /// GET `url`, returning the response whatever its status.
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        self.in_flight.store(true, Ordering::SeqCst);
        let response = self.channel.get(url).await;
        self.in_flight.store(false, Ordering::SeqCst);
        let response = response?;
        self.observe(&response);
        Ok(response)
    }

    fn observe(&self, response: &HttpResponse) {
        if let Some(keep_alive) = response.keep_alive {
            self.pool.note_keep_alive(self.index, keep_alive);
        }
    }

    /// Release the slot and drop its physical channel.
    pub fn discard(self) {
        self.in_flight.store(true, Ordering::SeqCst);
    }
}

impl Drop for PooledSlot {
    fn drop(&mut self) {
        let discard = self.in_flight.load(Ordering::SeqCst);
        if discard {
            log::debug!("[Pool] Discarding channel in slot {} of {}", self.index, self.pool.server);
        }
        self.pool.release(self.index, discard);
    }
}
