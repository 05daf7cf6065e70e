pub mod schema;

pub use schema::{Config, DaemonConfig, HandlerConfig, RemoteSessionConfig, WhatsAppConfig};
