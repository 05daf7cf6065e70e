//! In-memory protocol socket shared by the integration scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use chatlink::channels::{
    Connector, CredentialBundle, DisconnectReason, InboundMessage, MessageHandler, Presence,
    ReadyState, Socket, SocketConnection, SocketEvent,
};
use chatlink::channels::whatsapp::{SessionStore, WhatsAppSession};
use chatlink::config::WhatsAppConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const LINKED_JID: &str = "56955554444:9@s.whatsapp.net";

pub struct FakeSocket {
    ready: AtomicU8,
    events: mpsc::Sender<SocketEvent>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeSocket {
    pub fn emit(&self, event: SocketEvent) {
        self.events.try_send(event).expect("event channel");
    }

    pub fn issue_pairing_code(&self, payload: &str) {
        self.emit(SocketEvent::PairingCodeIssued(payload.to_string()));
    }

    pub fn open(&self) {
        self.ready.store(ReadyState::Open.as_u8(), Ordering::SeqCst);
        self.emit(SocketEvent::Opened);
    }

    pub fn close(&self, code: u16) {
        self.ready.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
        self.emit(SocketEvent::Closed {
            reason: DisconnectReason::from_status_code(code),
        });
    }

    pub fn deliver(&self, from: &str, text: &str) {
        self.emit(SocketEvent::MessageReceived(InboundMessage {
            id: Some("3EB0FEED".into()),
            from: from.to_string(),
            from_me: false,
            text: Some(text.to_string()),
        }));
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Socket for FakeSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::SeqCst))
    }

    fn user_id(&self) -> Option<String> {
        Some(LINKED_JID.to_string())
    }

    async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<String> {
        let mut sent = self.sent.lock();
        sent.push((to.to_string(), text.to_string()));
        Ok(format!("MSG{}", sent.len()))
    }

    async fn send_presence(&self, _to: &str, _presence: Presence) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.ready.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeConnector {
    dials: AtomicUsize,
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
}

impl FakeConnector {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn socket(&self, index: usize) -> Arc<FakeSocket> {
        self.sockets.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _credentials: Option<CredentialBundle>,
    ) -> anyhow::Result<SocketConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(32);
        let socket = Arc::new(FakeSocket {
            ready: AtomicU8::new(ReadyState::Connecting.as_u8()),
            events: tx,
            sent: Mutex::new(Vec::new()),
        });
        self.sockets.lock().push(socket.clone());
        Ok(SocketConnection { socket, events: rx })
    }
}

pub struct UppercaseHandler;

#[async_trait]
impl MessageHandler for UppercaseHandler {
    async fn handle(&self, text: &str, _sender: &str) -> anyhow::Result<String> {
        Ok(text.to_uppercase())
    }
}

pub fn session() -> (WhatsAppSession, Arc<FakeConnector>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let config = WhatsAppConfig {
        auth_dir: dir.path().join("auth"),
        print_qr_in_terminal: false,
        ..WhatsAppConfig::default()
    };
    let connector = Arc::new(FakeConnector::default());
    let store = SessionStore::new(&config.auth_dir);
    let session = WhatsAppSession::new(config, connector.clone(), store);
    (session, connector, dir)
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
