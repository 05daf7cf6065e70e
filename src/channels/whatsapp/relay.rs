use super::supervisor::WhatsAppSession;
use crate::channels::traits::{InboundMessage, Presence, ReadyState, Socket};
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;

/// Why an outbound message could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("WhatsApp socket not initialized")]
    NoSocket,
    #[error("WhatsApp is not connected")]
    NotConnected,
    #[error("WhatsApp socket not open (state: {0})")]
    SocketNotOpen(ReadyState),
    #[error("message send timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("message send failed: {0}")]
    Transport(anyhow::Error),
}

impl SendError {
    /// Failures detected before anything reached the wire. Never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NoSocket | Self::NotConnected | Self::SocketNotOpen(_))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX).collect();
    format!("{cut}...")
}

impl WhatsAppSession {
    fn ready_socket(&self) -> Result<Arc<dyn Socket>, SendError> {
        let socket = self.current_socket().ok_or(SendError::NoSocket)?;
        if !self.inner.state.lock().connected {
            return Err(SendError::NotConnected);
        }
        match socket.ready_state() {
            ReadyState::Open => Ok(socket),
            other => Err(SendError::SocketNotOpen(other)),
        }
    }

    /// Send `text` to `to` with the configured retry budget.
    pub async fn send_with_retry(&self, to: &str, text: &str) -> Result<String, SendError> {
        self.send_with_retries(to, text, self.inner.config.send_retries)
            .await
    }

    /// Up to `retries` attempts, each bounded by the send timeout. Attempt `n`
    /// is followed by a `n * send_retry_delay` pause. Precondition failures
    /// return immediately.
    pub async fn send_with_retries(
        &self,
        to: &str,
        text: &str,
        retries: u32,
    ) -> Result<String, SendError> {
        let retries = retries.max(1);
        let timeout = self.inner.config.message_send_timeout();
        let retry_delay = self.inner.config.send_retry_delay();

        let mut attempt = 1_u32;
        loop {
            let socket = match self.ready_socket() {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::error!("WhatsApp Web: cannot send to {to}: {e}");
                    return Err(e);
                }
            };

            let error = match tokio::time::timeout(timeout, socket.send_text(to, text)).await {
                Ok(Ok(message_id)) => {
                    let mut state = self.inner.state.lock();
                    state.messages_sent += 1;
                    state.touch();
                    return Ok(message_id);
                }
                Ok(Err(e)) => SendError::Transport(e),
                Err(_) => SendError::Timeout(timeout),
            };

            if attempt >= retries {
                tracing::error!("WhatsApp Web: send to {to} failed after {retries} attempts: {error}");
                return Err(error);
            }
            let pause = retry_delay * attempt;
            tracing::warn!(
                "WhatsApp Web: send attempt {attempt}/{retries} to {to} failed: {error}; retrying in {}ms",
                pause.as_millis()
            );
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }

    pub(super) fn dispatch_inbound(&self, message: InboundMessage) {
        if message.from_me {
            return;
        }
        let Some(text) = message
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
        else {
            tracing::debug!("WhatsApp Web: ignoring non-text message from {}", message.from);
            return;
        };

        {
            let mut state = self.inner.state.lock();
            state.messages_received += 1;
            state.touch();
        }
        tracing::info!(
            "WhatsApp Web: message from {}: {}",
            message.from,
            preview(&text)
        );

        let session = self.clone();
        tokio::spawn(async move { session.process_inbound(message.from, text).await });
    }

    async fn process_inbound(self, from: String, text: String) {
        self.set_presence(&from, Presence::Composing).await;

        if let Err(e) = self
            .send_with_retry(&from, &self.inner.config.ack_message)
            .await
        {
            tracing::warn!("WhatsApp Web: provisional reply to {from} failed: {e}");
        }

        match self.run_handler(&from, &text).await {
            Ok(reply) => {
                if !self.wait_until_open().await {
                    tracing::warn!(
                        "WhatsApp Web: connection did not recover, attempting reply to {from} anyway"
                    );
                }
                match self.send_with_retry(&from, &reply).await {
                    Ok(_) => tracing::info!("WhatsApp Web: reply sent to {from}"),
                    Err(e) => self.send_failure_notice(&from, "reply", e.to_string()).await,
                }
            }
            Err(e) => {
                self.send_failure_notice(&from, "handler", format!("{e:#}"))
                    .await;
            }
        }

        self.set_presence(&from, Presence::Paused).await;
    }

    async fn run_handler(&self, from: &str, text: &str) -> anyhow::Result<String> {
        let handler = self
            .inner
            .handler
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("no message handler installed"))?;
        let limit = self.inner.config.handler_timeout();

        let reply = tokio::time::timeout(limit, handler.handle(text, from))
            .await
            .map_err(|_| anyhow!("handler timed out after {}s", limit.as_secs()))??;
        if reply.trim().is_empty() {
            anyhow::bail!("handler returned an empty reply");
        }
        Ok(reply)
    }

    async fn send_failure_notice(&self, to: &str, context: &str, error: String) {
        tracing::error!("WhatsApp Web: {context} failed for {to}: {error}");
        self.inner.state.lock().record_error(context, &error);

        if let Err(e) = self
            .send_with_retry(to, &self.inner.config.failure_message)
            .await
        {
            tracing::warn!("WhatsApp Web: failure notice to {to} not delivered: {e}");
        }
    }

    /// Poll for an open connection for up to `recovery_poll_ticks` ticks.
    async fn wait_until_open(&self) -> bool {
        if self.is_open() {
            return true;
        }
        let ticks = self.inner.config.recovery_poll_ticks;
        let interval = self.inner.config.recovery_poll_interval();
        tracing::warn!(
            "WhatsApp Web: connection not open, waiting up to {}s for recovery",
            (interval * ticks).as_secs()
        );

        for _ in 0..ticks {
            tokio::time::sleep(interval).await;
            if self.is_open() {
                tracing::info!("WhatsApp Web: connection recovered");
                return true;
            }
        }
        false
    }

    async fn set_presence(&self, to: &str, presence: Presence) {
        let Some(socket) = self.current_socket() else {
            return;
        };
        if socket.ready_state() != ReadyState::Open {
            return;
        }
        if let Err(e) = socket.send_presence(to, presence).await {
            tracing::debug!("WhatsApp Web: presence update for {to} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::traits::SocketEvent;
    use crate::channels::whatsapp::test_support::{
        EchoHandler, FailingHandler, GatedHandler, harness, inbound, settle,
    };

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("hola"), "hola");
        let long = "a".repeat(200);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), 83);
    }

    #[test]
    fn only_local_failures_are_preconditions() {
        assert!(SendError::NoSocket.is_precondition());
        assert!(SendError::NotConnected.is_precondition());
        assert!(SendError::SocketNotOpen(ReadyState::Closing).is_precondition());
        assert!(!SendError::Timeout(Duration::from_secs(30)).is_precondition());
        assert!(!SendError::Transport(anyhow!("boom")).is_precondition());
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_socket_fails_fast() {
        let (session, connector, _dir) = harness();
        let err = session.send_with_retry("569@s.whatsapp.net", "hola").await.unwrap_err();
        assert!(matches!(err, SendError::NoSocket));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_on_unopened_socket_fails_without_retry() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = session.send_with_retry("569@s.whatsapp.net", "hola").await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(connector.socket(0).sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_on_closing_transport_fails_on_first_attempt() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.set_ready(ReadyState::Closing);
        let started = tokio::time::Instant::now();
        let err = session.send_with_retry("569@s.whatsapp.net", "hola").await.unwrap_err();
        assert!(matches!(err, SendError::SocketNotOpen(ReadyState::Closing)));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(socket.send_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_send_failures_are_retried_with_linear_pause() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.fail_next_sends(2);
        let started = tokio::time::Instant::now();
        let id = session.send_with_retry("569@s.whatsapp.net", "hola").await.unwrap();
        assert!(!id.is_empty());
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(socket.send_attempts(), 3);
        assert_eq!(session.status().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_gives_up_after_retry_budget() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.fail_next_sends(10);
        let err = session.send_with_retry("569@s.whatsapp.net", "hola").await.unwrap_err();
        assert!(matches!(err, SendError::Transport(_)));
        assert_eq!(socket.send_attempts(), 3);
        assert_eq!(session.status().messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.hang_sends(true);
        let err = session
            .send_with_retries("569@s.whatsapp.net", "hola", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_text_gets_ack_then_reply() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.emit(inbound("569@s.whatsapp.net", "hola"));
        settle().await;

        let sent = socket.sent_texts();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, session.config().ack_message);
        assert_eq!(sent[1], ("569@s.whatsapp.net".to_string(), "echo: hola".to_string()));
        assert_eq!(
            socket.presence_updates(),
            vec![Presence::Composing, Presence::Paused]
        );
        let status = session.status();
        assert_eq!(status.messages_received, 1);
        assert_eq!(status.messages_sent, 2);
        assert!(status.recent_errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn own_and_empty_messages_are_ignored() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.emit(SocketEvent::MessageReceived(InboundMessage {
            id: Some("A1".into()),
            from: "569@s.whatsapp.net".into(),
            from_me: true,
            text: Some("hola".into()),
        }));
        socket.emit(SocketEvent::MessageReceived(InboundMessage {
            id: Some("A2".into()),
            from: "569@s.whatsapp.net".into(),
            from_me: false,
            text: None,
        }));
        socket.emit(inbound("569@s.whatsapp.net", "   "));
        settle().await;

        assert!(socket.sent_texts().is_empty());
        assert_eq!(session.status().messages_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_sends_one_apology_and_records_error() {
        let (session, connector, _dir) = harness();
        session.connect(FailingHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.emit(inbound("569@s.whatsapp.net", "hola"));
        settle().await;

        let texts: Vec<String> = socket.sent_texts().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            texts,
            vec![
                session.config().ack_message.clone(),
                session.config().failure_message.clone()
            ]
        );
        let errors = session.status().recent_errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context, "handler");
        assert!(errors[0].message.contains("upstream exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_into_apology() {
        let (session, connector, _dir) = harness();
        let (handler, _release) = GatedHandler::new();
        session.connect(handler).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.emit(inbound("569@s.whatsapp.net", "hola"));
        tokio::time::sleep(Duration::from_secs(121)).await;

        let texts: Vec<String> = socket.sent_texts().into_iter().map(|(_, t)| t).collect();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[1], session.config().failure_message);
        assert!(session.status().recent_errors[0].message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_failure_is_not_recorded() {
        let (session, connector, _dir) = harness();
        session.connect(EchoHandler::arc()).await.unwrap();
        let socket = connector.socket(0);
        socket.open();
        settle().await;

        socket.fail_next_sends(3);
        socket.emit(inbound("569@s.whatsapp.net", "hola"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let sent = socket.sent_texts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "echo: hola");
        assert!(session.status().recent_errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_waits_for_reconnect_and_is_sent_once() {
        let (session, connector, _dir) = harness();
        let (handler, release) = GatedHandler::new();
        session.connect(handler).await.unwrap();
        let first = connector.socket(0);
        first.open();
        settle().await;

        first.emit(inbound("569@s.whatsapp.net", "hola"));
        settle().await;
        assert_eq!(first.sent_texts().len(), 1);

        first.close_with(408);
        settle().await;
        tokio::time::sleep(Duration::from_millis(2_010)).await;
        assert_eq!(connector.sockets_created(), 2);
        let second = connector.socket(1);

        release.notify_one();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(second.sent_texts().is_empty());

        second.open();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            second.sent_texts(),
            vec![("569@s.whatsapp.net".to_string(), "late: hola".to_string())]
        );
        assert_eq!(first.sent_texts().len(), 1);
        assert!(session.status().recent_errors.is_empty());
    }
}
