use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use wsproxy::Manager;

use crate::api::{self, ControlApi};
use crate::config::{Overrides, Settings};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address the control API and tunnel listeners bind to
    #[arg(long)]
    listen_ip: Option<IpAddr>,

    /// Port of the control API
    #[arg(long, short)]
    port: Option<u16>,

    /// Host name placed in the proxy URLs handed to callers
    #[arg(long)]
    proxy_host: Option<String>,

    /// Externally visible control API port, used for redirect URLs
    #[arg(long)]
    proxy_port: Option<u16>,

    /// HTTP proxy for reaching the gateway, e.g. http://proxy:3128
    #[arg(long)]
    https_proxy: Option<String>,

    /// Log at debug level regardless of WSPROXY_LOG
    #[arg(long)]
    debug: bool,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            listen_ip: self.listen_ip,
            control_port: self.port,
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port,
            https_proxy: self.https_proxy.clone(),
            debug: self.debug,
        }
    }
}

pub async fn execute(_args: &Args, settings: &Settings) -> Result<()> {
    let manager = Arc::new(Manager::new(settings.manager_config()?)?);
    if let Some(credentials) = settings.startup_credentials()? {
        manager.set_credentials(credentials);
    }

    let addr = SocketAddr::new(settings.listen_ip, settings.control_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control API on {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!("Control API listening on {}", local_addr);

    println!("wsproxy {} is running", env!("CARGO_PKG_VERSION"));
    println!("  Control API: http://{}", local_addr);
    println!(
        "  Tunnel ports: {}-{} on {}",
        settings.ports.min, settings.ports.max, settings.listen_ip
    );
    if !manager.is_configured() {
        println!();
        println!("No credentials yet. Run 'wsproxy configure' to set them.");
    }
    println!("\nPress Ctrl+C to stop.\n");

    let api = ControlApi::new(manager.clone(), settings.api_version.clone());
    api::serve(listener, api, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Stopping {} tunnel(s)", manager.tunnel_count());
    manager.shutdown().await;
    Ok(())
}
