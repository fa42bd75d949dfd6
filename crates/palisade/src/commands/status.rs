//! Status command - shows the stored session.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use console::{Style, style};
use serde::Serialize;

use super::{Context, report_session_events};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Refresh the token pair before reporting
    #[arg(long)]
    pub refresh: bool,
}

/// Status response for JSON output.
#[derive(Debug, Serialize)]
struct StatusOutput {
    authenticated: bool,
    user_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    expires_in_secs: Option<u64>,
    server_url: String,
    session_file: String,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    let mut events = client.subscribe();

    if args.refresh && client.is_authenticated() {
        let result = client.refresh().await;
        report_session_events(&mut events, ctx);
        result?;
    }

    let session = client.session()?;
    let output = StatusOutput {
        authenticated: client.is_authenticated() && session.is_some(),
        user_id: session.as_ref().and_then(|s| s.user_id.clone()),
        expires_at: session.as_ref().map(|s| s.expires_at),
        expires_in_secs: session.as_ref().map(|s| s.expires_in_secs()),
        server_url: ctx.config.base_url.clone(),
        session_file: ctx.token_store().path().display().to_string(),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!();
    println!("{}", style("Palisade Session Status").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    println!();

    match &session {
        Some(session) if output.authenticated => {
            println!(
                "  {} {}",
                dim.apply_to("Status:"),
                Style::new().green().apply_to("● logged in")
            );
            if let Some(user) = &session.user_id {
                println!("  {} {}", dim.apply_to("User:"), user);
            }
            let expiry = if session.is_expired() {
                Style::new().yellow().apply_to("expired (will refresh on next request)".to_string())
            } else {
                Style::new().apply_to(format!("in {}s", session.expires_in_secs()))
            };
            println!("  {} {}", dim.apply_to("Access token:"), expiry);
        }
        _ => {
            println!(
                "  {} {}",
                dim.apply_to("Status:"),
                Style::new().red().apply_to("● logged out")
            );
        }
    }
    println!("  {} {}", dim.apply_to("Server:"), output.server_url);
    if ctx.verbose {
        println!("  {} {}", dim.apply_to("Session file:"), output.session_file);
    }
    println!();

    Ok(())
}
