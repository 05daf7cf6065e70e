//! Credential persistence for the WhatsApp Web session.
//!
//! The protocol library hands us its credential file tree (`creds.json` plus
//! key files). [`SessionStore`] keeps that tree in a local auth directory and,
//! when a [`RemoteSessionStore`] is configured, mirrors it into a remote table
//! row keyed by the linked phone number so a fresh host can resume without
//! re-pairing.
//!
//! Every public operation degrades to "no session" on failure; nothing here
//! is allowed to take the connection down.

use crate::channels::traits::CredentialBundle;
use crate::config::RemoteSessionConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One row of the remote session table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSessionRecord {
    pub phone_number: String,
    pub session_data: CredentialBundle,
    pub last_connected: DateTime<Utc>,
    pub is_active: bool,
}

/// Durable remote storage for credential bundles.
#[async_trait]
pub trait RemoteSessionStore: Send + Sync {
    /// Insert or replace the row for `record.phone_number`.
    async fn upsert(&self, record: &RemoteSessionRecord) -> Result<()>;

    /// Most recently connected active row, optionally for one phone number.
    async fn fetch_latest(&self, phone_number: Option<&str>)
    -> Result<Option<RemoteSessionRecord>>;

    /// Flag rows inactive (all rows when `phone_number` is `None`).
    async fn deactivate(&self, phone_number: Option<&str>) -> Result<()>;
}

/// [`RemoteSessionStore`] over a PostgREST endpoint (`/rest/v1/<table>`).
pub struct PostgrestSessionStore {
    base_url: String,
    api_key: String,
    table: String,
    client: reqwest::Client,
}

impl PostgrestSessionStore {
    pub fn new(config: &RemoteSessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client for remote session store")?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            table: config.table.clone(),
            client,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl RemoteSessionStore for PostgrestSessionStore {
    async fn upsert(&self, record: &RemoteSessionRecord) -> Result<()> {
        let response = self
            .authorized(self.client.post(self.table_url()))
            .query(&[("on_conflict", "phone_number")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record])
            .send()
            .await
            .context("Remote session upsert request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Remote session upsert returned {status}: {body}");
        }
        Ok(())
    }

    async fn fetch_latest(
        &self,
        phone_number: Option<&str>,
    ) -> Result<Option<RemoteSessionRecord>> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("is_active", "eq.true".to_string()),
            ("order", "last_connected.desc".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(phone) = phone_number {
            query.push(("phone_number", format!("eq.{phone}")));
        }

        let response = self
            .authorized(self.client.get(self.table_url()))
            .query(&query)
            .send()
            .await
            .context("Remote session fetch request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Remote session fetch returned {status}: {body}");
        }

        let mut rows: Vec<RemoteSessionRecord> = response
            .json()
            .await
            .context("Remote session fetch returned malformed rows")?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    async fn deactivate(&self, phone_number: Option<&str>) -> Result<()> {
        let filter = phone_number.map_or_else(
            || ("is_active".to_string(), "eq.true".to_string()),
            |phone| ("phone_number".to_string(), format!("eq.{phone}")),
        );

        let response = self
            .authorized(self.client.patch(self.table_url()))
            .query(&[filter])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "is_active": false }))
            .send()
            .await
            .context("Remote session deactivate request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Remote session deactivate returned {status}: {body}");
        }
        Ok(())
    }
}

/// Local auth directory plus optional remote mirror.
#[derive(Clone)]
pub struct SessionStore {
    auth_dir: PathBuf,
    remote: Option<Arc<dyn RemoteSessionStore>>,
}

impl SessionStore {
    pub fn new(auth_dir: impl Into<PathBuf>) -> Self {
        Self {
            auth_dir: auth_dir.into(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteSessionStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn creds_path(&self) -> PathBuf {
        self.auth_dir.join(CredentialBundle::CREDS_FILE)
    }

    pub fn has_stored_session(&self) -> bool {
        self.creds_path().is_file()
    }

    /// True when `creds.json` parses and names the linked account.
    pub fn validate_session(&self) -> bool {
        let raw = match fs::read_to_string(self.creds_path()) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let creds: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("WhatsApp session: creds.json is corrupt: {e}");
                return false;
            }
        };

        let mut bundle = CredentialBundle::default();
        bundle
            .files
            .insert(CredentialBundle::CREDS_FILE.to_string(), creds);
        bundle.identity_ref().is_some()
    }

    /// Read every `*.json` file of the auth directory.
    pub fn load_credentials(&self) -> Option<CredentialBundle> {
        let entries = fs::read_dir(&self.auth_dir).ok()?;
        let mut bundle = CredentialBundle::default();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(value) => {
                    bundle.files.insert(name.to_string(), value);
                }
                Err(e) => {
                    tracing::warn!("WhatsApp session: skipping unreadable {name}: {e}");
                }
            }
        }

        if bundle.is_empty() { None } else { Some(bundle) }
    }

    /// Merge `bundle` into the auth directory. Each file is replaced atomically.
    pub fn save_credentials(&self, bundle: &CredentialBundle) -> Result<()> {
        fs::create_dir_all(&self.auth_dir).with_context(|| {
            format!(
                "Failed to create auth directory: {}",
                self.auth_dir.display()
            )
        })?;

        for (name, value) in &bundle.files {
            if !is_plain_file_name(name) {
                anyhow::bail!("Refusing to write credential file with unsafe name `{name}`");
            }
            let data = serde_json::to_vec_pretty(value)
                .with_context(|| format!("Failed to serialize credential file {name}"))?;
            write_atomic(&self.auth_dir, name, &data)?;
        }
        Ok(())
    }

    /// Remove all local credentials, leaving an empty auth directory.
    pub fn clear_local(&self) -> Result<()> {
        if self.auth_dir.exists() {
            fs::remove_dir_all(&self.auth_dir).with_context(|| {
                format!(
                    "Failed to remove auth directory: {}",
                    self.auth_dir.display()
                )
            })?;
        }
        fs::create_dir_all(&self.auth_dir).with_context(|| {
            format!(
                "Failed to recreate auth directory: {}",
                self.auth_dir.display()
            )
        })?;
        Ok(())
    }

    /// Upload the local credential tree as the row for `identifier`.
    pub async fn save_session_to_remote(&self, identifier: &str) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        let Some(bundle) = self.load_credentials() else {
            tracing::warn!("WhatsApp session: nothing to upload, no local credentials");
            return false;
        };

        let record = RemoteSessionRecord {
            phone_number: identifier.to_string(),
            session_data: bundle,
            last_connected: Utc::now(),
            is_active: true,
        };
        match remote.upsert(&record).await {
            Ok(()) => {
                tracing::info!("WhatsApp session: credentials saved remotely for {identifier}");
                true
            }
            Err(e) => {
                tracing::error!("WhatsApp session: remote save failed: {e:#}");
                false
            }
        }
    }

    /// Restore the newest active remote row into the auth directory.
    pub async fn load_session_from_remote(&self, identifier: Option<&str>) -> Option<String> {
        let remote = self.remote.as_ref()?;
        let record = match remote.fetch_latest(identifier).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!("WhatsApp session: no remote session found");
                return None;
            }
            Err(e) => {
                tracing::error!("WhatsApp session: remote load failed: {e:#}");
                return None;
            }
        };

        if record.session_data.is_empty() {
            tracing::warn!(
                "WhatsApp session: remote row for {} has no credentials",
                record.phone_number
            );
            return None;
        }
        if let Err(e) = self.save_credentials(&record.session_data) {
            tracing::error!("WhatsApp session: failed to write restored credentials: {e:#}");
            return None;
        }

        tracing::info!(
            "WhatsApp session: restored credentials for {} from remote",
            record.phone_number
        );
        Some(record.phone_number)
    }

    /// Mark remote rows inactive. Best-effort.
    pub async fn deactivate_remote(&self, identifier: Option<&str>) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        match remote.deactivate(identifier).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("WhatsApp session: remote deactivate failed: {e:#}");
                false
            }
        }
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let target = dir.join(name);
    let temp_path = dir.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));

    let mut temp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temporary file: {}", temp_path.display()))?;
    temp_file
        .write_all(data)
        .with_context(|| format!("Failed to write {name}"))?;
    temp_file.sync_all().ok();
    drop(temp_file);

    if let Err(e) = fs::rename(&temp_path, &target) {
        let _ = fs::remove_file(&temp_path);
        return Err(e).with_context(|| format!("Failed to replace {}", target.display()));
    }
    Ok(())
}
