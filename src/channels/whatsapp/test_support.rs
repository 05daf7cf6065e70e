use super::storage::SessionStore;
use super::supervisor::WhatsAppSession;
use crate::channels::traits::{
    Connector, CredentialBundle, DisconnectReason, InboundMessage, MessageHandler, Presence,
    ReadyState, Socket, SocketConnection, SocketEvent,
};
use crate::config::WhatsAppConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};

pub const MOCK_USER_ID: &str = "56911112222:1@s.whatsapp.net";

pub struct MockSocket {
    ready: AtomicU8,
    closed: AtomicBool,
    events: mpsc::Sender<SocketEvent>,
    sent: Mutex<Vec<(String, String)>>,
    presence: Mutex<Vec<Presence>>,
    attempts: AtomicU32,
    failures_left: AtomicU32,
    hang: AtomicBool,
}

impl MockSocket {
    fn new(events: mpsc::Sender<SocketEvent>) -> Self {
        Self {
            ready: AtomicU8::new(ReadyState::Connecting.as_u8()),
            closed: AtomicBool::new(false),
            events,
            sent: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            failures_left: AtomicU32::new(0),
            hang: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: SocketEvent) {
        self.events
            .try_send(event)
            .expect("mock event channel full or closed");
    }

    pub fn set_ready(&self, state: ReadyState) {
        self.ready.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.set_ready(ReadyState::Open);
        self.emit(SocketEvent::Opened);
    }

    pub fn close_with(&self, code: u16) {
        self.set_ready(ReadyState::Closed);
        self.emit(SocketEvent::Closed {
            reason: DisconnectReason::from_status_code(code),
        });
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn presence_updates(&self) -> Vec<Presence> {
        self.presence.lock().clone()
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn hang_sends(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn send_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Socket for MockSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::SeqCst))
    }

    fn user_id(&self) -> Option<String> {
        Some(MOCK_USER_ID.to_string())
    }

    async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("transport hiccup on attempt {attempt}");
        }
        self.sent.lock().push((to.to_string(), text.to_string()));
        Ok(format!("MSG{attempt}"))
    }

    async fn send_presence(&self, _to: &str, presence: Presence) -> anyhow::Result<()> {
        self.presence.lock().push(presence);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_ready(ReadyState::Closed);
    }
}

#[derive(Default)]
pub struct MockConnector {
    calls: AtomicUsize,
    failures_left: AtomicU32,
    gate: Mutex<Option<Arc<Notify>>>,
    sockets: Mutex<Vec<Arc<MockSocket>>>,
    offered: Mutex<Vec<Option<CredentialBundle>>>,
}

impl MockConnector {
    pub fn credentials(identity: &str) -> CredentialBundle {
        let mut bundle = CredentialBundle::default();
        bundle.files.insert(
            CredentialBundle::CREDS_FILE.to_string(),
            serde_json::json!({ "me": { "id": identity }, "registered": true }),
        );
        bundle
    }

    /// Hold every subsequent dial until the returned notify fires.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sockets_created(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        self.sockets.lock()[index].clone()
    }

    pub fn credentials_seen(&self, index: usize) -> Option<CredentialBundle> {
        self.offered.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        credentials: Option<CredentialBundle>,
    ) -> anyhow::Result<SocketConnection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.offered.lock().push(credentials);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("bridge unreachable");
        }

        let (tx, rx) = mpsc::channel(64);
        let socket = Arc::new(MockSocket::new(tx));
        self.sockets.lock().push(socket.clone());
        Ok(SocketConnection {
            socket,
            events: rx,
        })
    }
}

pub struct EchoHandler;

impl EchoHandler {
    pub fn arc() -> Arc<dyn MessageHandler> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, text: &str, _sender: &str) -> anyhow::Result<String> {
        Ok(format!("echo: {text}"))
    }
}

pub struct FailingHandler;

impl FailingHandler {
    pub fn arc() -> Arc<dyn MessageHandler> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _text: &str, _sender: &str) -> anyhow::Result<String> {
        anyhow::bail!("upstream exploded")
    }
}

/// Replies only after the paired notify fires.
pub struct GatedHandler {
    release: Arc<Notify>,
}

impl GatedHandler {
    pub fn new() -> (Arc<dyn MessageHandler>, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        let handler: Arc<dyn MessageHandler> = Arc::new(Self {
            release: release.clone(),
        });
        (handler, release)
    }
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(&self, text: &str, _sender: &str) -> anyhow::Result<String> {
        self.release.notified().await;
        Ok(format!("late: {text}"))
    }
}

pub fn inbound(from: &str, text: &str) -> SocketEvent {
    SocketEvent::MessageReceived(InboundMessage {
        id: Some("3EB0C0FFEE".into()),
        from: from.to_string(),
        from_me: false,
        text: Some(text.to_string()),
    })
}

pub fn harness() -> (WhatsAppSession, Arc<MockConnector>, TempDir) {
    let dir = TempDir::new().expect("temp auth dir");
    let store = SessionStore::new(dir.path().join("auth"));
    let (session, connector) = harness_with(store, WhatsAppConfig::default());
    (session, connector, dir)
}

pub fn harness_with(
    store: SessionStore,
    config: WhatsAppConfig,
) -> (WhatsAppSession, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::default());
    let session = WhatsAppSession::new(
        WhatsAppConfig {
            print_qr_in_terminal: false,
            ..config
        },
        connector.clone(),
        store,
    );
    (session, connector)
}

/// Let every runnable task make progress under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
