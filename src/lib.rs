#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::unnecessary_wraps
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod channels;
pub mod config;
pub mod daemon;
pub mod handler;

pub use config::Config;

/// Stored-session maintenance subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommands {
    /// Report whether valid local credentials exist
    Check,
    /// Delete local credentials and deactivate the remote copy
    Clear,
    /// Upload local credentials to the remote session table
    Push {
        /// Phone identifier the row is keyed by
        phone: String,
    },
    /// Restore local credentials from the remote session table
    Pull {
        /// Fetch this phone's row instead of the most recent active one
        #[arg(long)]
        phone: Option<String>,
    },
}
