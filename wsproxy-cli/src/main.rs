use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use url::Url;

mod api;
mod client;
mod command;
mod config;
mod sys;

#[derive(Debug, clap::Parser)]
#[command(name = "wsproxy", version)]
#[command(about = "Reach apps running inside compute sessions through local ports.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Config file to use instead of the per-user one
    #[arg(long, global = true, env = "WSPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Control API of the daemon, defaults to the configured control port
    #[arg(long, global = true, env = "WSPROXY_CONTROL_URL")]
    control_url: Option<Url>,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity, debug: bool) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("WSPROXY_LOG")
        .from_env_lossy();
    let env_filter = if debug {
        env_filter.add_directive(LevelFilter::DEBUG.into())
    } else {
        env_filter
    };

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

fn control_client(cli: &Cli, settings: &config::Settings) -> Result<client::ControlClient> {
    let base = match &cli.control_url {
        Some(url) => url.clone(),
        None => {
            let host = match settings.listen_ip {
                ip if ip.is_unspecified() => "127.0.0.1".to_string(),
                std::net::IpAddr::V6(ip) => format!("[{}]", ip),
                std::net::IpAddr::V4(ip) => ip.to_string(),
            };
            Url::parse(&format!("http://{}:{}/", host, settings.control_port))
                .context("Invalid control API address")?
        }
    };
    Ok(client::ControlClient::new(base))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Settings::load(cli.config.as_deref(), &cli.command.overrides())?;
    init_logger_env(&cli.verbose, settings.debug);

    match &cli.command {
        command::Command::Serve(args) => {
            command::serve::execute(args, &settings).await?;
        }
        command::Command::Configure(args) => {
            command::configure::execute(args, &control_client(&cli, &settings)?).await?;
        }
        command::Command::Add(args) => {
            command::add::execute(args, &control_client(&cli, &settings)?).await?;
        }
        command::Command::Delete(args) => {
            command::delete::execute(args, &control_client(&cli, &settings)?).await?;
        }
        command::Command::Status(args) => {
            command::status::execute(args, &control_client(&cli, &settings)?).await?;
        }
    }

    Ok(())
}
