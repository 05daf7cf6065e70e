use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Number of failures kept in [`ConnectionState::recent_errors`].
pub const RECENT_ERRORS_CAPACITY: usize = 10;

/// Where the supervisor's state machine currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    AwaitingPairing,
    Open,
    Closed,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: String,
    pub message: String,
}

/// Bounded error history, oldest entry evicted first.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    entries: VecDeque<ErrorRecord>,
    capacity: usize,
}

impl ErrorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, context: &str, message: impl ToString) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ErrorRecord {
            at: Utc::now(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<ErrorRecord> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_capacity(RECENT_ERRORS_CAPACITY)
    }
}

/// A scannable pairing code waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    pub raw: String,
    /// `data:` URL the dashboard renders as an image.
    pub image: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub connected: bool,
    pub connecting: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub phone_identifier: Option<String>,
    pub pending_pairing_code: Option<PairingCode>,
    pub last_activity: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub recent_errors: ErrorLog,
}

impl ConnectionState {
    pub fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    pub fn record_error(&mut self, context: &str, message: impl ToString) {
        self.recent_errors.push(context, message);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let now = Utc::now();
        let uptime_ms = match (self.connected, self.last_connected) {
            (true, Some(since)) => u64::try_from((now - since).num_milliseconds()).unwrap_or(0),
            _ => 0,
        };

        StatusSnapshot {
            state: self.phase,
            connected: self.connected,
            has_pending_pairing_code: self.pending_pairing_code.is_some(),
            pairing_code_image: self.pending_pairing_code.as_ref().map(|c| c.image.clone()),
            reconnect_attempts: self.reconnect_attempts,
            phone_identifier: self.phone_identifier.clone(),
            last_connected: self.last_connected,
            last_disconnected: self.last_disconnected,
            last_activity: self.last_activity,
            uptime_ms,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            recent_errors: self.recent_errors.to_vec(),
            timestamp: now,
        }
    }
}

/// Point-in-time view of the connection, serialized for the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionPhase,
    pub connected: bool,
    pub has_pending_pairing_code: bool,
    pub pairing_code_image: Option<String>,
    pub reconnect_attempts: u32,
    pub phone_identifier: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub recent_errors: Vec<ErrorRecord>,
    pub timestamp: DateTime<Utc>,
}
