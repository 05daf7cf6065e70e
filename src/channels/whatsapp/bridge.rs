//! WebSocket transport to the WhatsApp Web protocol bridge.
//!
//! The bridge speaks the multi-device protocol on our behalf and exchanges
//! JSON frames tagged by `type` over a single WebSocket:
//!
//! - client → bridge: `hello`, `send_text`, `presence`
//! - bridge → client: `qr`, `open`, `close`, `message`, `creds`,
//!   `send_ack`, `send_error`
//!
//! `send_text` requests carry a `request_id`; the bridge answers each with a
//! `send_ack` or `send_error` frame echoing it.

use crate::channels::traits::{
    Connector, CredentialBundle, DisconnectReason, InboundMessage, Presence, ReadyState, Socket,
    SocketConnection, SocketEvent,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Hello {
        client: &'a str,
        credentials: Option<&'a CredentialBundle>,
    },
    SendText {
        request_id: &'a str,
        to: &'a str,
        text: &'a str,
    },
    Presence {
        to: &'a str,
        state: Presence,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeFrame {
    Qr {
        code: String,
    },
    Open {
        #[serde(default)]
        user_id: Option<String>,
    },
    Close {
        status_code: u16,
        #[serde(default)]
        reason: Option<String>,
    },
    Message {
        #[serde(default)]
        id: Option<String>,
        from: String,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        text: Option<String>,
    },
    Creds {
        files: BTreeMap<String, serde_json::Value>,
    },
    SendAck {
        request_id: String,
        message_id: String,
    },
    SendError {
        request_id: String,
        error: String,
    },
}

type PendingSends = HashMap<String, oneshot::Sender<Result<String>>>;

struct BridgeShared {
    ready: AtomicU8,
    user_id: Mutex<Option<String>>,
    pending: Mutex<PendingSends>,
}

impl BridgeShared {
    fn new() -> Self {
        Self {
            ready: AtomicU8::new(ReadyState::Open.as_u8()),
            user_id: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state.as_u8(), Ordering::Release);
    }

    fn resolve(&self, request_id: &str, result: Result<String>) {
        match self.pending.lock().remove(request_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => tracing::debug!("WhatsApp bridge: reply for unknown request {request_id}"),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(anyhow!("{reason}")));
        }
    }
}

/// Removes a pending send when its caller gives up waiting.
struct PendingGuard<'a> {
    shared: &'a BridgeShared,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}

/// Dials the bridge; one WebSocket per [`Connector::connect`] call.
pub struct BridgeConnector {
    url: String,
    client_name: String,
}

impl BridgeConnector {
    pub fn new(url: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: client_name.into(),
        }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, credentials: Option<CredentialBundle>) -> Result<SocketConnection> {
        tracing::debug!("WhatsApp bridge: connecting to {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to WhatsApp bridge at {}", self.url))?;
        let (mut write, read) = ws_stream.split();

        let hello = ClientFrame::Hello {
            client: &self.client_name,
            credentials: credentials.as_ref(),
        };
        write
            .send(WsMessage::text(serde_json::to_string(&hello)?))
            .await
            .context("Failed to send hello frame to WhatsApp bridge")?;

        let shared = Arc::new(BridgeShared::new());
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        let (event_tx, event_rx) = mpsc::channel(128);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::warn!("WhatsApp bridge: write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });
        tokio::spawn(read_loop(read, shared.clone(), event_tx));

        Ok(SocketConnection {
            socket: Arc::new(BridgeSocket {
                shared,
                outbound: outbound_tx,
            }),
            events: event_rx,
        })
    }
}

/// Map one bridge frame to a socket event, settling send replies in place.
fn translate(frame: BridgeFrame, shared: &BridgeShared) -> Option<SocketEvent> {
    match frame {
        BridgeFrame::Qr { code } => Some(SocketEvent::PairingCodeIssued(code)),
        BridgeFrame::Open { user_id } => {
            *shared.user_id.lock() = user_id;
            Some(SocketEvent::Opened)
        }
        BridgeFrame::Close {
            status_code,
            reason,
        } => {
            tracing::info!(
                "WhatsApp bridge: closed with status {status_code} ({})",
                reason.as_deref().unwrap_or("no reason")
            );
            shared.set_ready(ReadyState::Closed);
            Some(SocketEvent::Closed {
                reason: DisconnectReason::from_status_code(status_code),
            })
        }
        BridgeFrame::Message {
            id,
            from,
            from_me,
            text,
        } => Some(SocketEvent::MessageReceived(InboundMessage {
            id,
            from,
            from_me,
            text,
        })),
        BridgeFrame::Creds { files } => {
            Some(SocketEvent::CredentialsUpdated(CredentialBundle { files }))
        }
        BridgeFrame::SendAck {
            request_id,
            message_id,
        } => {
            shared.resolve(&request_id, Ok(message_id));
            None
        }
        BridgeFrame::SendError { request_id, error } => {
            shared.resolve(&request_id, Err(anyhow!(error)));
            None
        }
    }
}

async fn read_loop<S>(mut read: S, shared: Arc<BridgeShared>, events: mpsc::Sender<SocketEvent>)
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut close_reported = false;

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("WhatsApp bridge: read failed: {e}");
                break;
            }
        };

        let frame: BridgeFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("WhatsApp bridge: ignoring unparseable frame: {e}");
                continue;
            }
        };

        let Some(event) = translate(frame, &shared) else {
            continue;
        };
        close_reported = matches!(event, SocketEvent::Closed { .. });
        if events.send(event).await.is_err() || close_reported {
            break;
        }
    }

    shared.set_ready(ReadyState::Closed);
    shared.fail_pending("WhatsApp bridge connection closed");
    if !close_reported {
        let _ = events
            .send(SocketEvent::Closed {
                reason: DisconnectReason::ConnectionLost,
            })
            .await;
    }
}

pub struct BridgeSocket {
    shared: Arc<BridgeShared>,
    outbound: mpsc::Sender<WsMessage>,
}

impl BridgeSocket {
    async fn send_frame(&self, frame: &ClientFrame<'_>) -> Result<()> {
        let payload = serde_json::to_string(frame)?;
        self.outbound
            .send(WsMessage::text(payload))
            .await
            .map_err(|_| anyhow!("WhatsApp bridge writer has shut down"))
    }
}

#[async_trait]
impl Socket for BridgeSocket {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.shared.ready.load(Ordering::Acquire))
    }

    fn user_id(&self) -> Option<String> {
        self.shared.user_id.lock().clone()
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            shared: &self.shared,
            request_id: request_id.clone(),
        };

        self.send_frame(&ClientFrame::SendText {
            request_id: &request_id,
            to,
            text,
        })
        .await?;

        rx.await
            .map_err(|_| anyhow!("WhatsApp bridge dropped send request {request_id}"))?
    }

    async fn send_presence(&self, to: &str, presence: Presence) -> Result<()> {
        self.send_frame(&ClientFrame::Presence {
            to,
            state: presence,
        })
        .await
    }

    async fn close(&self) {
        if self.ready_state() != ReadyState::Closed {
            self.shared.set_ready(ReadyState::Closing);
        }
        let _ = self.outbound.try_send(WsMessage::Close(None));
        self.shared.fail_pending("WhatsApp bridge socket closed");
    }
}
