use super::backoff::{ReconnectDecision, ReconnectPolicy};
use super::monitor::{LivenessMonitor, LivenessProbe};
use super::pairing;
use super::state::{ConnectionPhase, ConnectionState, StatusSnapshot};
use super::storage::SessionStore;
use crate::channels::traits::{
    Connector, CredentialBundle, DisconnectReason, MessageHandler, ReadyState, Socket,
    SocketEvent, phone_from_jid,
};
use crate::config::WhatsAppConfig;
use anyhow::{Result, anyhow};
use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of a [`WhatsAppSession::connect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A socket was created; pairing or open events follow.
    Started,
    /// Another `connect()` is still dialing. Nothing was created.
    AlreadyInProgress,
    /// An open socket is already installed.
    AlreadyConnected,
    /// `disconnect()` ran while this call was dialing; the new socket was closed.
    Cancelled,
}

#[derive(Clone)]
pub(super) struct ActiveSocket {
    pub(super) generation: u64,
    pub(super) socket: Arc<dyn Socket>,
}

pub(super) struct Inner {
    pub(super) config: WhatsAppConfig,
    pub(super) policy: ReconnectPolicy,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) store: SessionStore,
    pub(super) state: Mutex<ConnectionState>,
    pub(super) active: Mutex<Option<ActiveSocket>>,
    pub(super) handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    monitor: Mutex<Option<LivenessMonitor>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    next_generation: AtomicU64,
    /// Bumped by every explicit teardown; work scheduled under an older epoch is dropped.
    epoch: AtomicU64,
    connect_in_flight: AtomicBool,
}

/// Releases the in-flight flag even when the connect future is dropped midway.
struct ConnectGuard<'a>(&'a AtomicBool);

impl<'a> ConnectGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The single logical WhatsApp Web connection of this process.
///
/// Cheap to clone; every clone drives the same socket, state machine and
/// background tasks. Callers observe the connection only through
/// [`status`](Self::status) and change it only through the control
/// operations (`connect`, `disconnect`, `restart`, `clear_session`).
#[derive(Clone)]
pub struct WhatsAppSession {
    pub(super) inner: Arc<Inner>,
}

impl WhatsAppSession {
    pub fn new(config: WhatsAppConfig, connector: Arc<dyn Connector>, store: SessionStore) -> Self {
        let policy = config.reconnect_policy();
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                connector,
                store,
                state: Mutex::new(ConnectionState::default()),
                active: Mutex::new(None),
                handler: Mutex::new(None),
                monitor: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                connect_in_flight: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &WhatsAppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.state.lock().snapshot()
    }

    pub fn has_stored_session(&self) -> bool {
        self.inner.store.has_stored_session()
    }

    /// Connected flag set and the installed socket reports an open transport.
    pub fn is_open(&self) -> bool {
        if !self.inner.state.lock().connected {
            return false;
        }
        self.current_socket()
            .is_some_and(|socket| socket.ready_state() == ReadyState::Open)
    }

    /// Dial the protocol and start relaying messages to `handler`.
    ///
    /// A backoff redial that is still waiting is cancelled; this call replaces it.
    pub async fn connect(&self, handler: Arc<dyn MessageHandler>) -> Result<ConnectOutcome> {
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            tracing::debug!("WhatsApp Web: manual connect supersedes pending reconnect");
            task.abort();
        }
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        self.clone().connect_inner(handler, epoch).await
    }

    fn connect_inner(
        self,
        handler: Arc<dyn MessageHandler>,
        epoch: u64,
    ) -> BoxFuture<'static, Result<ConnectOutcome>> {
        Box::pin(async move {
            let Some(_guard) = ConnectGuard::acquire(&self.inner.connect_in_flight) else {
                tracing::warn!("WhatsApp Web: connection already in progress");
                return Ok(ConnectOutcome::AlreadyInProgress);
            };
            if self.is_open() {
                tracing::debug!("WhatsApp Web: connect requested while already open");
                return Ok(ConnectOutcome::AlreadyConnected);
            }

            *self.inner.handler.lock() = Some(handler);
            {
                let mut state = self.inner.state.lock();
                state.phase = ConnectionPhase::Connecting;
                state.connecting = true;
            }
            self.retire_socket().await;

            tracing::info!("WhatsApp Web: starting connection");
            let credentials = self.prepare_credentials().await;

            let timeout = self.inner.config.connection_timeout();
            let dialed =
                tokio::time::timeout(timeout, self.inner.connector.connect(credentials)).await;
            let connection = match dialed {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(self.connect_failed(e, epoch)),
                Err(_) => {
                    return Err(self.connect_failed(
                        anyhow!("connection attempt timed out after {}ms", timeout.as_millis()),
                        epoch,
                    ));
                }
            };

            if self.inner.epoch.load(Ordering::Acquire) != epoch {
                tracing::info!("WhatsApp Web: disconnected while dialing, dropping new socket");
                connection.socket.close().await;
                let mut state = self.inner.state.lock();
                state.connecting = false;
                state.phase = ConnectionPhase::Idle;
                return Ok(ConnectOutcome::Cancelled);
            }

            let generation = self.inner.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
            *self.inner.active.lock() = Some(ActiveSocket {
                generation,
                socket: connection.socket,
            });
            tokio::spawn(self.clone().pump_events(generation, connection.events));
            tracing::debug!("WhatsApp Web: socket generation {generation} installed");
            Ok(ConnectOutcome::Started)
        })
    }

    /// Local credentials, restored from the remote table first when absent.
    async fn prepare_credentials(&self) -> Option<CredentialBundle> {
        let store = &self.inner.store;
        if !store.has_stored_session() && store.has_remote() {
            if let Some(phone) = store.load_session_from_remote(None).await {
                self.inner.state.lock().phone_identifier = Some(phone);
            }
        }

        if !store.has_stored_session() {
            tracing::info!("WhatsApp Web: no stored session, a pairing code will be issued");
            return None;
        }
        if !store.validate_session() {
            tracing::warn!("WhatsApp Web: stored session is invalid, pairing from scratch");
            return None;
        }
        tracing::info!("WhatsApp Web: resuming stored session");
        store.load_credentials()
    }

    fn connect_failed(&self, error: anyhow::Error, epoch: u64) -> anyhow::Error {
        tracing::error!("WhatsApp Web: failed to connect: {error:#}");
        let current = self.inner.epoch.load(Ordering::Acquire) == epoch;
        {
            let mut state = self.inner.state.lock();
            state.connecting = false;
            state.connected = false;
            // A disconnect during the dial already settled the session as idle.
            state.phase = if current {
                ConnectionPhase::Closed
            } else {
                ConnectionPhase::Idle
            };
            state.record_error("connect", format!("{error:#}"));
        }
        if current {
            self.schedule_reconnect();
        }
        error
    }

    /// Close the socket and stop every background task. Stored credentials stay.
    pub async fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        self.retire_socket().await;

        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.connecting = false;
            state.last_disconnected = Some(Utc::now());
            state.pending_pairing_code = None;
            state.reconnect_attempts = 0;
            state.phase = ConnectionPhase::Idle;
        }
        tracing::info!("WhatsApp Web disconnected");
    }

    /// Disconnect, forget every stored credential and reset the state.
    pub async fn clear_session(&self) -> Result<()> {
        let phone = self.inner.state.lock().phone_identifier.clone();
        self.disconnect().await;
        *self.inner.state.lock() = ConnectionState::default();

        self.inner.store.clear_local()?;
        if self.inner.store.has_remote() {
            self.inner.store.deactivate_remote(phone.as_deref()).await;
        }
        tracing::info!("WhatsApp Web session cleared");
        Ok(())
    }

    pub async fn restart(&self, handler: Arc<dyn MessageHandler>) -> Result<ConnectOutcome> {
        self.disconnect().await;
        tokio::time::sleep(self.inner.config.restart_cooldown()).await;
        self.connect(handler).await
    }

    pub(super) fn current_socket(&self) -> Option<Arc<dyn Socket>> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.socket.clone())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    async fn retire_socket(&self) {
        self.stop_monitor();
        self.inner.state.lock().pending_pairing_code = None;
        let previous = self.inner.active.lock().take();
        if let Some(previous) = previous {
            tracing::debug!(
                "WhatsApp Web: closing socket generation {}",
                previous.generation
            );
            previous.socket.close().await;
        }
    }

    async fn pump_events(self, generation: u64, mut events: mpsc::Receiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                tracing::debug!("WhatsApp Web: dropping events of superseded socket {generation}");
                return;
            }
            let closed = matches!(event, SocketEvent::Closed { .. });
            self.handle_event(generation, event).await;
            if closed {
                return;
            }
        }

        if self.is_current(generation) {
            tracing::warn!("WhatsApp Web: event stream ended without a close event");
            self.handle_event(
                generation,
                SocketEvent::Closed {
                    reason: DisconnectReason::ConnectionLost,
                },
            )
            .await;
        }
    }

    async fn handle_event(&self, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::PairingCodeIssued(payload) => self.on_pairing_code(&payload),
            SocketEvent::Opened => self.on_open(generation),
            SocketEvent::Closed { reason } => self.on_close(generation, reason),
            SocketEvent::MessageReceived(message) => self.dispatch_inbound(message),
            SocketEvent::CredentialsUpdated(bundle) => self.persist_credentials(bundle).await,
        }
    }

    /// Write a credential update on the blocking pool. The pump awaits it, so
    /// updates land in arrival order.
    async fn persist_credentials(&self, bundle: CredentialBundle) {
        let store = self.inner.store.clone();
        match tokio::task::spawn_blocking(move || store.save_credentials(&bundle)).await {
            Ok(Ok(())) => tracing::debug!("WhatsApp Web: credentials persisted"),
            Ok(Err(e)) => tracing::warn!("WhatsApp Web: failed to persist credentials: {e:#}"),
            Err(e) => tracing::warn!("WhatsApp Web: credential writer panicked: {e}"),
        }
    }

    fn on_pairing_code(&self, payload: &str) {
        let code = match pairing::pairing_code(payload) {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!("WhatsApp Web: could not render pairing code: {e:#}");
                self.inner.state.lock().record_error("pairing", format!("{e:#}"));
                return;
            }
        };

        if self.inner.config.print_qr_in_terminal {
            match pairing::render_terminal(payload) {
                Ok(rendered) => {
                    eprintln!();
                    eprintln!("WhatsApp Web QR code (scan in WhatsApp > Linked Devices):");
                    eprintln!("{rendered}");
                    eprintln!();
                }
                Err(err) => {
                    tracing::warn!("WhatsApp Web: failed to render pairing QR in terminal: {err}");
                }
            }
        }

        let mut state = self.inner.state.lock();
        state.pending_pairing_code = Some(code);
        state.reconnect_attempts = 0;
        state.phase = ConnectionPhase::AwaitingPairing;
        tracing::info!("WhatsApp Web: new pairing code issued (scan with WhatsApp > Linked Devices)");
    }

    fn on_open(&self, generation: u64) {
        let phone = self
            .current_socket()
            .and_then(|socket| socket.user_id())
            .and_then(|id| phone_from_jid(&id));

        {
            let now = Utc::now();
            let mut state = self.inner.state.lock();
            state.connected = true;
            state.connecting = false;
            state.phase = ConnectionPhase::Open;
            state.last_connected = Some(now);
            state.last_activity = Some(now);
            state.pending_pairing_code = None;
            state.reconnect_attempts = 0;
            if phone.is_some() {
                state.phone_identifier.clone_from(&phone);
            }
        }
        match &phone {
            Some(phone) => tracing::info!("WhatsApp Web connected successfully as {phone}"),
            None => tracing::info!("WhatsApp Web connected successfully"),
        }

        self.start_monitor(generation);

        if let Some(phone) = phone {
            if self.inner.store.has_remote() {
                let store = self.inner.store.clone();
                tokio::spawn(async move {
                    store.save_session_to_remote(&phone).await;
                });
            }
        }
    }

    fn on_close(&self, generation: u64, reason: DisconnectReason) {
        self.stop_monitor();
        let closed = {
            let mut active = self.inner.active.lock();
            if active.as_ref().is_some_and(|a| a.generation == generation) {
                active.take()
            } else {
                None
            }
        };
        if let Some(closed) = closed {
            tokio::spawn(async move { closed.socket.close().await });
        }

        let mut state = self.inner.state.lock();
        state.connected = false;
        state.connecting = false;
        state.last_disconnected = Some(Utc::now());
        state.pending_pairing_code = None;

        if reason.is_logged_out() {
            state.phase = ConnectionPhase::LoggedOut;
            state.reconnect_attempts = 0;
            state.record_error(
                "connection",
                format!("logged out (code {}), new pairing required", reason.status_code()),
            );
            tracing::warn!(
                "WhatsApp Web session logged out (code {}). A new pairing code is required.",
                reason.status_code()
            );
            return;
        }

        state.phase = ConnectionPhase::Closed;
        drop(state);
        tracing::warn!(
            "WhatsApp Web connection closed (code {}, {reason:?})",
            reason.status_code()
        );
        self.schedule_reconnect();
    }

    pub(super) fn schedule_reconnect(&self) {
        let decision = {
            let mut state = self.inner.state.lock();
            let decision = self.inner.policy.decide(state.reconnect_attempts);
            match decision {
                ReconnectDecision::Retry { attempt, .. } => state.reconnect_attempts = attempt,
                ReconnectDecision::GiveUp => {
                    state.reconnect_attempts = 0;
                    state.record_error("reconnect", "maximum reconnect attempts reached");
                }
            }
            decision
        };

        let (delay, attempt) = match decision {
            ReconnectDecision::Retry { delay, attempt } => (delay, attempt),
            ReconnectDecision::GiveUp => {
                tracing::error!(
                    "WhatsApp Web: maximum reconnect attempts reached, waiting for a manual connect"
                );
                return;
            }
        };

        let Some(handler) = self.inner.handler.lock().clone() else {
            tracing::warn!("WhatsApp Web: no message handler installed, not reconnecting");
            return;
        };
        tracing::info!(
            "WhatsApp Web: reconnecting in {}ms (attempt {attempt}/{})",
            delay.as_millis(),
            self.inner.policy.max_attempts
        );

        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let generation = self.inner.next_generation.load(Ordering::Acquire);
        let session = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if session.inner.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            if session.inner.next_generation.load(Ordering::Acquire) != generation {
                tracing::debug!("WhatsApp Web: a newer socket was installed, skipping reconnect");
                return;
            }
            // Detach so a later schedule from inside this dial does not abort it.
            drop(session.inner.reconnect_task.lock().take());
            if let Err(e) = session.connect_inner(handler, epoch).await {
                tracing::debug!("WhatsApp Web: scheduled reconnect failed: {e:#}");
            }
        });
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn start_monitor(&self, generation: u64) {
        let monitor = LivenessMonitor::spawn(
            self.clone(),
            generation,
            self.inner.config.keepalive_interval(),
            self.inner.config.liveness_failure_threshold.max(1),
        );
        if let Some(previous) = self.inner.monitor.lock().replace(monitor) {
            previous.stop();
        }
    }

    fn stop_monitor(&self) {
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.stop();
        }
    }

    /// One liveness sample of socket `generation`.
    pub(super) fn probe_liveness(&self, generation: u64) -> LivenessProbe {
        let socket = match self.inner.active.lock().as_ref() {
            Some(active) if active.generation == generation => active.socket.clone(),
            _ => return LivenessProbe::Stale,
        };

        let ready = socket.ready_state();
        let mut state = self.inner.state.lock();
        if ready == ReadyState::Open {
            if state.phase == ConnectionPhase::Open {
                state.connected = true;
            }
            state.touch();
            LivenessProbe::Healthy
        } else {
            state.connected = false;
            LivenessProbe::Unhealthy(ready)
        }
    }

    /// Tear down socket `generation` and dial again with the installed handler.
    pub(super) fn request_forced_reconnect(&self, generation: u64) {
        let epoch = self.inner.epoch.load(Ordering::Acquire);
        let session = self.clone();
        let task = tokio::spawn(async move {
            if session.inner.epoch.load(Ordering::Acquire) != epoch
                || !session.is_current(generation)
            {
                tracing::debug!("WhatsApp Web: ignoring forced reconnect for stale socket");
                return;
            }
            let Some(handler) = session.inner.handler.lock().clone() else {
                return;
            };

            tracing::warn!("WhatsApp Web: socket unhealthy, forcing reconnect");
            {
                let mut state = session.inner.state.lock();
                state.connected = false;
                state.phase = ConnectionPhase::Closed;
                state.record_error("liveness", "socket not open, forcing reconnect");
            }
            drop(session.inner.reconnect_task.lock().take());
            if let Err(e) = session.clone().connect_inner(handler, epoch).await {
                tracing::warn!("WhatsApp Web: forced reconnect failed: {e:#}");
            }
        });
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    #[cfg(test)]
    pub(super) fn has_pending_reconnect(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}
