use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport ready-state, mirroring the WebSocket `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{label} ({})", self.as_u8())
    }
}

/// Chat presence shown to the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Composing,
    Paused,
}

/// Why the protocol closed the socket, classified from its status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    UnavailableService,
    RestartRequired,
    Unknown(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::UnavailableService,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::UnavailableService => 503,
            Self::RestartRequired => 515,
            Self::Unknown(code) => code,
        }
    }

    /// Terminal reasons: the linked device is gone and only a fresh pairing
    /// brings it back, so no automatic reconnect is attempted.
    pub fn is_logged_out(self) -> bool {
        matches!(self, Self::LoggedOut | Self::ConnectionClosed)
    }
}

/// Credential file tree as produced by the protocol library.
///
/// Keys are plain file names inside the auth directory (`creds.json` holds the
/// account identity), values are the JSON documents stored in them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialBundle {
    pub files: BTreeMap<String, serde_json::Value>,
}

impl CredentialBundle {
    pub const CREDS_FILE: &'static str = "creds.json";

    pub fn creds(&self) -> Option<&serde_json::Value> {
        self.files.get(Self::CREDS_FILE)
    }

    /// Account identity reference (`me.id` in `creds.json`).
    pub fn identity_ref(&self) -> Option<&str> {
        self.creds()?
            .get("me")?
            .get("id")?
            .as_str()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Phone identifier of the linked account, derived from `me.id`.
    pub fn phone_identifier(&self) -> Option<String> {
        self.identity_ref().and_then(phone_from_jid)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// `"15551234567:12@s.whatsapp.net"` → `"15551234567"`.
pub fn phone_from_jid(jid: &str) -> Option<String> {
    let user = jid.split('@').next().unwrap_or(jid);
    let phone = user.split(':').next().unwrap_or(user).trim();
    if phone.is_empty() {
        None
    } else {
        Some(phone.to_string())
    }
}

/// A chat message delivered by the protocol socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: Option<String>,
    /// Chat JID the message came from; replies go back to it.
    pub from: String,
    pub from_me: bool,
    pub text: Option<String>,
}

/// Everything a socket can tell the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    PairingCodeIssued(String),
    Opened,
    Closed { reason: DisconnectReason },
    MessageReceived(InboundMessage),
    CredentialsUpdated(CredentialBundle),
}

/// A live protocol socket. Owned by the session supervisor.
#[async_trait]
pub trait Socket: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Account JID once the device is linked (e.g. `"15551234567:12@s.whatsapp.net"`).
    fn user_id(&self) -> Option<String>;

    /// Send a text message and return the protocol message id.
    async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<String>;

    async fn send_presence(&self, to: &str, presence: Presence) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Socket plus the ordered stream of its events.
pub struct SocketConnection {
    pub socket: Arc<dyn Socket>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Creates protocol sockets, optionally resuming from stored credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: Option<CredentialBundle>)
    -> anyhow::Result<SocketConnection>;
}

/// Computes the reply for an inbound chat message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, text: &str, sender: &str) -> anyhow::Result<String>;
}
