use crate::channels::whatsapp::ReconnectPolicy;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// Remote credential table. Absent means local-only sessions.
    #[serde(default)]
    pub remote_session: Option<RemoteSessionConfig>,

    #[serde(default)]
    pub handler: HandlerConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ── WhatsApp Web connection ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Directory holding the credential file tree (`creds.json` and friends).
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,
    /// WebSocket URL of the protocol bridge.
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// Name shown under WhatsApp > Linked Devices.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Liveness sampling cadence.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Consecutive non-open samples before a forced reconnect.
    #[serde(default = "default_liveness_failure_threshold")]
    pub liveness_failure_threshold: u32,
    #[serde(default = "default_message_send_timeout_ms")]
    pub message_send_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    /// Base delay between send attempts; attempt `n` waits `n * delay`.
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,
    #[serde(default = "default_restart_cooldown_ms")]
    pub restart_cooldown_ms: u64,
    /// How long a finished reply waits for a dropped connection to come back.
    #[serde(default = "default_recovery_poll_ticks")]
    pub recovery_poll_ticks: u32,
    #[serde(default = "default_recovery_poll_interval_ms")]
    pub recovery_poll_interval_ms: u64,
    /// Upper bound on a single handler invocation.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Provisional reply sent as soon as a message arrives.
    #[serde(default = "default_ack_message")]
    pub ack_message: String,
    /// Sent instead of the answer when the handler fails.
    #[serde(default = "default_failure_message")]
    pub failure_message: String,
    #[serde(default = "default_true")]
    pub print_qr_in_terminal: bool,
}

fn default_auth_dir() -> PathBuf {
    chatlink_home().join("whatsapp_auth")
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787/whatsapp".into()
}

fn default_client_name() -> String {
    "Alquimia Dashboard".into()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_initial_retry_delay_ms() -> u64 {
    2_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_liveness_failure_threshold() -> u32 {
    3
}

fn default_message_send_timeout_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    60_000
}

fn default_send_retries() -> u32 {
    3
}

fn default_send_retry_delay_ms() -> u64 {
    1_000
}

fn default_restart_cooldown_ms() -> u64 {
    2_000
}

fn default_recovery_poll_ticks() -> u32 {
    30
}

fn default_recovery_poll_interval_ms() -> u64 {
    1_000
}

fn default_handler_timeout_ms() -> u64 {
    120_000
}

fn default_ack_message() -> String {
    "⏳ Recibido, estoy analizando tu consulta...".into()
}

fn default_failure_message() -> String {
    "❌ Lo siento, ocurrió un error procesando tu mensaje. Intenta nuevamente en unos minutos."
        .into()
}

fn default_true() -> bool {
    true
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            auth_dir: default_auth_dir(),
            bridge_url: default_bridge_url(),
            client_name: default_client_name(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            liveness_failure_threshold: default_liveness_failure_threshold(),
            message_send_timeout_ms: default_message_send_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            send_retries: default_send_retries(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            restart_cooldown_ms: default_restart_cooldown_ms(),
            recovery_poll_ticks: default_recovery_poll_ticks(),
            recovery_poll_interval_ms: default_recovery_poll_interval_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            ack_message: default_ack_message(),
            failure_message: default_failure_message(),
            print_qr_in_terminal: default_true(),
        }
    }
}

impl WhatsAppConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.initial_retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn message_send_timeout(&self) -> Duration {
        Duration::from_millis(self.message_send_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn recovery_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_poll_interval_ms.max(1))
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

// ── Remote credential table ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionConfig {
    /// Project URL of the PostgREST-compatible store (e.g. a Supabase project).
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_session_table")]
    pub table: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_session_table() -> String {
    "whatsapp_sessions".into()
}

fn default_remote_timeout_secs() -> u64 {
    10
}

// ── Message handler ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Dashboard chat endpoint. When unset, messages are echoed back.
    #[serde(default)]
    pub chat_url: Option<String>,
    #[serde(default = "default_handler_provider")]
    pub provider: String,
    #[serde(default = "default_handler_model")]
    pub model_id: String,
    #[serde(default = "default_handler_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_handler_provider() -> String {
    "gemini".into()
}

fn default_handler_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_handler_http_timeout_secs() -> u64 {
    110
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            chat_url: None,
            provider: default_handler_provider(),
            model_id: default_handler_model(),
            timeout_secs: default_handler_http_timeout_secs(),
        }
    }
}

// ── Daemon ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where `run` periodically writes the status snapshot.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_status_flush_secs")]
    pub status_flush_secs: u64,
}

fn default_status_file() -> PathBuf {
    chatlink_home().join("whatsapp_status.json")
}

fn default_status_flush_secs() -> u64 {
    5
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_file: default_status_file(),
            status_flush_secs: default_status_flush_secs(),
        }
    }
}

fn chatlink_home() -> PathBuf {
    UserDirs::new().map_or_else(
        || PathBuf::from(".chatlink"),
        |dirs| dirs.home_dir().join(".chatlink"),
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: chatlink_home().join("config.toml"),
            whatsapp: WhatsAppConfig::default(),
            remote_session: None,
            handler: HandlerConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_at(&home.join(".chatlink").join("config.toml"))
    }

    pub fn load_or_init_at(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.to_path_buf();
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Bridge URL: WHATSAPP_WS_URL
        if let Ok(url) = std::env::var("WHATSAPP_WS_URL") {
            if !url.is_empty() {
                self.whatsapp.bridge_url = url;
            }
        }

        // Auth directory: CHATLINK_AUTH_DIR
        if let Ok(dir) = std::env::var("CHATLINK_AUTH_DIR") {
            if !dir.is_empty() {
                self.whatsapp.auth_dir = PathBuf::from(dir);
            }
        }

        // Chat endpoint: CHATLINK_CHAT_URL
        if let Ok(url) = std::env::var("CHATLINK_CHAT_URL") {
            if !url.is_empty() {
                self.handler.chat_url = Some(url);
            }
        }

        // Remote table: SUPABASE_URL + SUPABASE_ANON_KEY (both required)
        if let (Ok(url), Ok(key)) = (
            std::env::var("SUPABASE_URL"),
            std::env::var("SUPABASE_ANON_KEY"),
        ) {
            if !url.is_empty() && !key.is_empty() {
                let table = self
                    .remote_session
                    .as_ref()
                    .map_or_else(default_session_table, |r| r.table.clone());
                let timeout_secs = self
                    .remote_session
                    .as_ref()
                    .map_or_else(default_remote_timeout_secs, |r| r.timeout_secs);
                self.remote_session = Some(RemoteSessionConfig {
                    url,
                    api_key: key,
                    table,
                    timeout_secs,
                });
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config file")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e).context("Failed to atomically replace config file");
        }

        Ok(())
    }
}
