use anyhow::{Context, Result};
use serde::Deserialize;

use crate::client::ControlClient;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Compute session ID
    session_id: String,

    /// Only show the tunnel of this app
    #[arg(long)]
    app: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TunnelRow {
    app: String,
    port: u16,
    proxy_url: String,
    upstream_url: String,
    connections: usize,
}

pub async fn execute(args: &Args, client: &ControlClient) -> Result<()> {
    let status = client
        .status(&args.session_id, args.app.as_deref())
        .await?;
    let tunnels: Vec<TunnelRow> = serde_json::from_value(status["tunnels"].clone())
        .context("Failed to parse tunnel list")?;

    println!("Session: {}", args.session_id);
    for tunnel in tunnels {
        println!();
        println!("  App:         {}", tunnel.app);
        println!("  Port:        {}", tunnel.port);
        println!("  Proxy:       {}", tunnel.proxy_url);
        println!("  Upstream:    {}", tunnel.upstream_url);
        println!("  Connections: {}", tunnel.connections);
    }
    Ok(())
}
