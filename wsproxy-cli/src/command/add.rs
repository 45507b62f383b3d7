use std::collections::BTreeMap;

use anyhow::{Result, anyhow};

use crate::client::ControlClient;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Compute session ID
    session_id: String,

    /// App to reach inside the session, e.g. jupyter or sshd
    #[arg(long)]
    app: String,

    /// Environment variable for the app as KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    envs: Vec<(String, String)>,

    /// Argument for the app (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    arguments: Vec<String>,
}

fn parse_env(value: &str) -> Result<(String, String)> {
    let (key, value) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", value))?;
    if key.is_empty() {
        return Err(anyhow!("empty variable name in '{}={}'", key, value));
    }
    Ok((key.to_string(), value.to_string()))
}

pub async fn execute(args: &Args, client: &ControlClient) -> Result<()> {
    let envs: BTreeMap<String, String> = args.envs.iter().cloned().collect();
    let added = client
        .add(&args.session_id, &args.app, &envs, &args.arguments)
        .await?;

    let verb = if added["created"].as_bool().unwrap_or(true) {
        "Opened"
    } else {
        "Reusing"
    };
    println!("{} tunnel to {} in {}", verb, args.app, args.session_id);
    println!("  Proxy: {}", added["proxy"].as_str().unwrap_or("-"));
    println!("  Open:  {}", added["url"].as_str().unwrap_or("-"));
    Ok(())
}
