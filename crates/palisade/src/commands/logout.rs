//! Logout command - end the session.

use anyhow::Result;
use clap::Args;

use super::Context;

/// Arguments for the logout command.
#[derive(Args, Debug)]
pub struct LogoutArgs {}

/// Run the logout command.
pub async fn run(_args: LogoutArgs, ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    let was_logged_in = client.is_authenticated();
    client.logout();

    if ctx.json_output {
        println!("{}", serde_json::json!({ "logged_out": was_logged_in }));
    } else if was_logged_in {
        println!("Logged out.");
    } else {
        println!("Not logged in.");
    }
    Ok(())
}
