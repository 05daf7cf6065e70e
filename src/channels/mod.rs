pub mod traits;
pub mod whatsapp;

pub use traits::{
    Connector, CredentialBundle, DisconnectReason, InboundMessage, MessageHandler, Presence,
    ReadyState, Socket, SocketConnection, SocketEvent,
};
pub use whatsapp::WhatsAppSession;

use crate::SessionCommands;
use crate::config::Config;
use anyhow::{Result, bail};
use std::sync::Arc;
use whatsapp::{PostgrestSessionStore, SessionStore};

/// Session store for the configured auth directory, mirrored remotely when
/// `[remote_session]` is set.
pub fn build_store(config: &Config) -> Result<SessionStore> {
    let store = SessionStore::new(&config.whatsapp.auth_dir);
    match &config.remote_session {
        Some(remote) => {
            tracing::info!("WhatsApp session: remote mirror enabled ({})", remote.table);
            Ok(store.with_remote(Arc::new(PostgrestSessionStore::new(remote)?)))
        }
        None => Ok(store),
    }
}

/// Phone identifier of the locally linked account, if any.
fn local_phone(store: &SessionStore) -> Option<String> {
    store.load_credentials()?.phone_identifier()
}

pub async fn handle_command(command: SessionCommands, config: &Config) -> Result<()> {
    let store = build_store(config)?;
    match command {
        SessionCommands::Check => {
            println!("Auth directory: {}", store.auth_dir().display());
            if !store.has_stored_session() {
                println!("❌ No stored session (a pairing code will be issued on connect)");
            } else if store.validate_session() {
                match local_phone(&store) {
                    Some(phone) => println!("✅ Valid session for {phone}"),
                    None => println!("✅ Valid session"),
                }
            } else {
                println!("⚠️  Stored session is invalid (pairing will start from scratch)");
            }
            Ok(())
        }
        SessionCommands::Clear => {
            let phone = local_phone(&store);
            store.clear_local()?;
            if store.has_remote() {
                store.deactivate_remote(phone.as_deref()).await;
            }
            println!("✅ Session cleared");
            Ok(())
        }
        SessionCommands::Push { phone } => {
            if !store.has_remote() {
                bail!("No remote session table configured (set [remote_session] or SUPABASE_URL)");
            }
            if !store.save_session_to_remote(phone.trim()).await {
                bail!("Failed to upload session for {phone}");
            }
            println!("✅ Session uploaded for {phone}");
            Ok(())
        }
        SessionCommands::Pull { phone } => {
            if !store.has_remote() {
                bail!("No remote session table configured (set [remote_session] or SUPABASE_URL)");
            }
            match store.load_session_from_remote(phone.as_deref()).await {
                Some(restored) => {
                    println!("✅ Session restored for {restored}");
                    Ok(())
                }
                None => bail!("No active remote session found"),
            }
        }
    }
}
