//! Shared application state.
//!
//! A single [`SharedState`] handle is cloned into the poller, the command
//! interpreter, and whatever front end is attached. All fields live behind
//! one `std::sync::Mutex`, which is never held across an await point, so
//! readers always observe a consistent status/measurement pair.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use log::warn;

/// Messages retained in the rolling history.
pub const HISTORY_CAPACITY: usize = 200;

/// Connection lifecycle of the instrument link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal lifecycle edge.
    /// Self-transitions are allowed; `Disconnected` is reachable from
    /// anywhere because closing the link is always legal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next || next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Failed, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One voltage/current sample with its acquisition time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub voltage: f64,
    pub current: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct StateInner {
    status: ConnectionState,
    latest: Option<Measurement>,
    messages: VecDeque<String>,
}

/// Cloneable handle to the agent's shared state.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<StateInner>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                status: ConnectionState::Disconnected,
                latest: None,
                messages: VecDeque::with_capacity(HISTORY_CAPACITY),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        // A poisoned state mutex only happens after a panic elsewhere;
        // recover the data rather than cascading.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> ConnectionState {
        self.lock().status
    }

    /// Apply a lifecycle transition. Illegal edges are logged and ignored,
    /// returning `false`.
    pub fn set_status(&self, next: ConnectionState) -> bool {
        let mut inner = self.lock();
        if !inner.status.can_transition_to(next) {
            warn!(
                "ignoring illegal connection transition {} -> {}",
                inner.status, next
            );
            return false;
        }
        inner.status = next;
        true
    }

    pub fn latest(&self) -> Option<Measurement> {
        self.lock().latest
    }

    /// Store a fresh sample and the status it was taken under as one
    /// atomic update.
    pub fn publish(&self, measurement: Measurement, status: ConnectionState) {
        let mut inner = self.lock();
        inner.latest = Some(measurement);
        if inner.status.can_transition_to(status) {
            inner.status = status;
        }
    }

    /// Append a message to the rolling history, timestamped with local
    /// wall-clock time. Multi-line messages become one entry per line so
    /// the history stays line-oriented.
    pub fn push_message(&self, message: &str) {
        let stamp = Local::now().format("[%H:%M:%S]");
        let mut inner = self.lock();
        for line in message.lines() {
            if inner.messages.len() == HISTORY_CAPACITY {
                inner.messages.pop_front();
            }
            inner.messages.push_back(format!("{stamp} {line}"));
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().messages.iter().cloned().collect()
    }

    pub fn clear_messages(&self) {
        self.lock().messages.clear();
    }
}
