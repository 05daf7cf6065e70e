use crate::channels::whatsapp::{BridgeConnector, ConnectOutcome, WhatsAppSession};
use crate::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub async fn run(config: Config) -> Result<()> {
    let store = crate::channels::build_store(&config)?;
    let connector = Arc::new(BridgeConnector::new(
        config.whatsapp.bridge_url.clone(),
        config.whatsapp.client_name.clone(),
    ));
    let handler = crate::handler::build_handler(&config.handler)?;
    let session = WhatsAppSession::new(config.whatsapp.clone(), connector, store);

    let status_path = config.daemon.status_file.clone();
    let writer = spawn_state_writer(
        session.clone(),
        status_path.clone(),
        Duration::from_secs(config.daemon.status_flush_secs.max(1)),
    );

    match session.connect(handler).await {
        Ok(ConnectOutcome::Started) => {}
        Ok(outcome) => tracing::info!("Initial WhatsApp connect: {outcome:?}"),
        Err(e) => tracing::warn!("Initial WhatsApp connect failed, retrying in background: {e:#}"),
    }

    println!("📱 chatlink daemon started");
    println!("   Bridge:  {}", config.whatsapp.bridge_url);
    println!("   Status:  {}", status_path.display());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    writer.abort();
    let _ = writer.await;
    session.disconnect().await;
    write_status(&session, &status_path).await?;
    Ok(())
}

pub async fn write_status(session: &WhatsAppSession, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(&session.status())?;
    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, data)
        .await
        .with_context(|| format!("Failed to write status file {}", temp.display()))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("Failed to replace status file {}", path.display()))
}

pub fn read_status(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path).with_context(|| {
        format!(
            "No status file at {} (is `chatlink run` running?)",
            path.display()
        )
    })?;
    serde_json::from_str(&raw).with_context(|| format!("Corrupt status file {}", path.display()))
}

fn spawn_state_writer(session: WhatsAppSession, path: PathBuf, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = write_status(&session, &path).await {
                tracing::warn!("{e:#}");
            }
        }
    })
}
