#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::uninlined_format_args
)]

use anyhow::Result;
use chatlink::{Config, SessionCommands, channels, daemon};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

/// `chatlink` - keeps one WhatsApp Web account linked and relays its chats.
#[derive(Parser, Debug)]
#[command(name = "chatlink")]
#[command(version)]
#[command(about = "WhatsApp Web connection manager for the chat dashboard.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to WhatsApp and relay messages until Ctrl+C
    Run,

    /// Print the status snapshot written by a running daemon
    Status,

    /// Manage stored WhatsApp credentials
    Session {
        #[command(subcommand)]
        session_command: SessionCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Run => daemon::run(config).await,
        Commands::Status => {
            let status = daemon::read_status(&config.daemon.status_file)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Session { session_command } => {
            channels::handle_command(session_command, &config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn session_pull_accepts_optional_phone() {
        let cli = Cli::try_parse_from(["chatlink", "session", "pull", "--phone", "56911112222"])
            .unwrap();
        match cli.command {
            Commands::Session {
                session_command: SessionCommands::Pull { phone },
            } => assert_eq!(phone.as_deref(), Some("56911112222")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn session_push_requires_phone() {
        assert!(Cli::try_parse_from(["chatlink", "session", "push"]).is_err());
    }
}
