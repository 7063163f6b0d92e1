//! Session lifecycle notifications.
//!
//! Listeners return `Result`; a failing listener is logged and the
//! remaining listeners still run.

use std::sync::{Arc, Mutex};

/// Lifecycle event of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session authenticated.
    Connected {
        /// Session id (for logs).
        session: String,
        /// Server the session talks to.
        server: String,
        /// Strategy that authenticated it.
        strategy: &'static str,
    },

    /// New tickets were stored.
    TicketsRefilled {
        /// Session id.
        session: String,
        /// Number of tickets received.
        count: usize,
    },

    /// The session's WebSocket sub-channel is ready.
    WebSocketConnected {
        /// Session id.
        session: String,
    },

    /// The shared WebSocket closed underneath the session.
    WebSocketClosed {
        /// Session id.
        session: String,
    },

    /// The session was torn down.
    Disconnected {
        /// Session id.
        session: String,
        /// Why it ended.
        reason: String,
    },
}

/// Callback for [`SessionEvent`]s.
pub type EventListener = Arc<dyn Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Fans events out to every registered listener.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<Vec<EventListener>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners().len())
            .finish()
    }
}

impl EventDispatcher {
    fn listeners(&self) -> Vec<EventListener> {
        self.listeners
            .lock()
            .expect("EventDispatcher mutex poisoned")
            .clone()
    }

    /// Register a listener.
    pub fn add(&self, listener: EventListener) {
        self.listeners
            .lock()
            .expect("EventDispatcher mutex poisoned")
            .push(listener);
    }

    /// Deliver `event` to every listener.
    pub fn emit(&self, event: &SessionEvent) {
        for listener in self.listeners() {
            if let Err(e) = listener(event) {
                log::warn!("[Events] Listener failed on {:?}: {:#}", event, e);
            }
        }
    }
}
