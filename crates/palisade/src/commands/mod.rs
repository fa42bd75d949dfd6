//! CLI command handlers.

pub mod logout;
pub mod request;
pub mod session;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use console::style;
use palisade_session::{FileTokenStore, SessionClient, SessionConfig, SessionEvent};
use tokio::sync::broadcast;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Session layer configuration.
    pub config: SessionConfig,
    /// Directory holding the stored session.
    pub data_dir: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Token store backed by `<data dir>/session.json`.
    pub fn token_store(&self) -> FileTokenStore {
        FileTokenStore::new(&self.data_dir)
    }

    /// A client over the stored session, already initialized.
    pub fn client(&self) -> Result<SessionClient> {
        let client = SessionClient::builder()
            .config(self.config.clone())
            .token_store(Arc::new(self.token_store()))
            .build()
            .context("failed to create session client")?;
        client.init();
        Ok(client)
    }
}

/// Tell the user about session changes that happened during the command.
pub fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>, ctx: &Context) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Ended { reason } if !ctx.json_output => {
                eprintln!(
                    "{} session ended ({}). Run `palisade session set` to log in again.",
                    style("!").yellow().bold(),
                    reason
                );
            }
            SessionEvent::Refreshed if ctx.verbose && !ctx.json_output => {
                eprintln!("{} access token refreshed", style("·").dim());
            }
            _ => {}
        }
    }
}
