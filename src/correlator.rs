//! Matches application replies to the calls that caused them.
//!
//! Every call gets a strictly increasing id and a oneshot slot in the
//! pending map. Replies are matched by id, not by send order, so calls may
//! complete out of order. Closing the correlator resolves every pending slot
//! with the closing error; nothing is left hanging.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, SessionError};

/// Application call as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Correlation id.
    pub id: u64,
    /// Remote method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// Error half of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Server-defined code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// Application reply as received from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Id of the call being answered.
    pub id: u64,
    /// Result value on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ReplyFrame {
    /// Successful reply.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error reply.
    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RemoteError {
                code,
                message: message.into(),
            }),
        }
    }

    fn into_result(self) -> Result<Value> {
        match self.error {
            Some(RemoteError { code, message }) => Err(SessionError::Remote { code, message }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

type Slot = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct CorrelatorState {
    pending: HashMap<u64, Slot>,
    closed: Option<SessionError>,
}

/// Pending-call table for one logical connection.
pub struct RequestCorrelator {
    next_id: AtomicU64,
    state: Mutex<CorrelatorState>,
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestCorrelator")
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(CorrelatorState::default()),
        }
    }
}

impl RequestCorrelator {
    /// Create an open correlator. Ids start at 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CorrelatorState> {
        self.state.lock().expect("RequestCorrelator mutex poisoned")
    }

    /// Allocate an id for a call and record its pending slot.
    pub fn register(self: &Arc<Self>, method: &str, params: Value) -> Result<(CallFrame, PendingCall)> {
        let mut state = self.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        Ok((
            CallFrame {
                id,
                method: method.to_string(),
                params,
            },
            PendingCall {
                id,
                rx,
                correlator: Arc::downgrade(self),
            },
        ))
    }

    /// Deliver a reply. Returns `false` when no call with that id is pending.
    pub fn resolve(&self, reply: ReplyFrame) -> bool {
        let slot = self.lock().pending.remove(&reply.id);
        match slot {
            Some(slot) => {
                // The caller may have given up already.
                let _ = slot.send(reply.into_result());
                true
            }
            None => {
                log::debug!("[Correlator] Reply for unknown call {}", reply.id);
                false
            }
        }
    }

    /// Fail every pending call with `err`. Returns how many were rejected.
    pub fn reject_all(&self, err: &SessionError) -> usize {
        let drained: Vec<Slot> = self.lock().pending.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(err.clone()));
        }
        if count > 0 {
            log::info!("[Correlator] Rejected {} pending calls: {}", count, err);
        }
        count
    }

    /// Reject everything pending and refuse new calls with `err`.
    pub fn close(&self, err: &SessionError) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(err.clone());
            }
        }
        self.reject_all(err);
    }

    /// `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Drop the slot for `id` without resolving it.
    pub fn forget(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

/// Caller's side of a registered call. Dropping it forgets the call.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    correlator: Weak<RequestCorrelator>,
}

impl PendingCall {
    /// Id of the call.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply.
    pub async fn wait(mut self) -> Result<Value> {
        (&mut self.rx)
            .await
            .unwrap_or(Err(SessionError::ConnectionClosed))
    }

    /// Take the reply if it has already been delivered.
    pub fn try_take(&mut self) -> Option<Result<Value>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.forget(self.id);
        }
    }
}
