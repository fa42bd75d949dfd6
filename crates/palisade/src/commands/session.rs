//! Session command - install or refresh the stored session.

use anyhow::{Context as _, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use palisade_session::Session;

use super::{Context, report_session_events};

/// Arguments for the session command.
#[derive(Args, Debug)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Store a token pair obtained from login, registration or SSO
    Set {
        /// Access token
        #[arg(long, env = "PALISADE_ACCESS_TOKEN")]
        access_token: String,

        /// Refresh token
        #[arg(long, env = "PALISADE_REFRESH_TOKEN")]
        refresh_token: String,

        /// Seconds until the access token expires
        #[arg(long, default_value_t = 900)]
        expires_in: i64,

        /// Authenticated user id
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Exchange the refresh token for a new pair now
    Refresh,
}

/// Run the session command.
pub async fn run(args: SessionArgs, ctx: &Context) -> Result<()> {
    match args.command {
        SessionCommand::Set {
            access_token,
            refresh_token,
            expires_in,
            user_id,
        } => {
            let mut session = Session::new(
                access_token,
                refresh_token,
                Utc::now() + chrono::Duration::seconds(expires_in),
            );
            if let Some(user_id) = user_id {
                session = session.with_user_id(user_id);
            }
            cmd_set(session, ctx)
        }
        SessionCommand::Refresh => cmd_refresh(ctx).await,
    }
}

fn cmd_set(session: Session, ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    client
        .establish(session)
        .context("failed to store session")?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "authenticated": true }));
    } else {
        println!("Session stored in {}", ctx.token_store().path().display());
    }
    Ok(())
}

async fn cmd_refresh(ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    if !client.is_authenticated() {
        anyhow::bail!("not logged in; run `palisade session set` first");
    }

    let mut events = client.subscribe();
    let result = client.refresh().await;
    report_session_events(&mut events, ctx);
    result.context("token refresh failed")?;

    let session = client.session()?;
    let expires_in_secs = session.as_ref().map(|s| s.expires_in_secs());
    if ctx.json_output {
        println!("{}", serde_json::json!({ "refreshed": true, "expires_in_secs": expires_in_secs }));
    } else {
        println!("Token refreshed (expires in {}s)", expires_in_secs.unwrap_or(0));
    }
    Ok(())
}
