use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use url::Url;
use wsproxy::credentials::DEFAULT_API_VERSION;
use wsproxy::{Credentials, ManagerConfig, PortRange};

use crate::sys;

const ENV_PREFIX: &str = "WSPROXY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_ip: IpAddr,
    pub control_port: u16,
    pub proxy_host: String,
    /// Port callers use to reach the control API. Defaults to `control_port`.
    pub proxy_port: Option<u16>,
    pub debug: bool,
    pub https_proxy: Option<String>,
    pub api_version: String,
    pub ports: PortSettings,
    pub timeouts: TimeoutSettings,
    pub console_apps: Vec<String>,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    pub credentials: Option<CredentialSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 5050,
            proxy_host: manager.proxy_host,
            proxy_port: None,
            debug: false,
            https_proxy: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            ports: PortSettings::default(),
            timeouts: TimeoutSettings::default(),
            console_apps: manager.console_apps,
            retry_limit: manager.retry_limit,
            retry_delay_ms: manager.retry_delay.as_millis() as u64,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub min: u16,
    pub max: u16,
    pub pool_size: usize,
    pub max_attempts: usize,
}

impl Default for PortSettings {
    fn default() -> Self {
        let range = PortRange::default();
        Self {
            min: range.min,
            max: range.max,
            pool_size: range.pool_size,
            max_attempts: range.max_attempts,
        }
    }
}

/// Timeouts in seconds. An idle timeout of `0` disables it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub idle: u64,
    pub console_idle: u64,
    pub handshake: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            idle: 60,
            console_idle: 30,
            handshake: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialSettings {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub api_version: Option<String>,
}

/// Values given on the command line. They win over every other source.
#[derive(Debug, Default)]
pub struct Overrides {
    pub listen_ip: Option<IpAddr>,
    pub control_port: Option<u16>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub https_proxy: Option<String>,
    pub debug: bool,
}

impl Settings {
    /// Layers the config file, `WSPROXY_*` variables and `overrides`.
    ///
    /// An explicit `path` must exist; the per-user file is optional.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let builder = match path {
            Some(path) => config::Config::builder().add_source(File::from(path).required(true)),
            None => match sys::user_config_file() {
                Some(path) => {
                    tracing::debug!("Looking for config at {}", path.display());
                    config::Config::builder().add_source(File::from(path).required(false))
                }
                None => config::Config::builder(),
            },
        };
        Self::layer(builder, overrides)
    }

    #[cfg(test)]
    fn from_toml(source: &str, overrides: &Overrides) -> Result<Self> {
        let builder =
            config::Config::builder().add_source(File::from_str(source, config::FileFormat::Toml));
        Self::layer(builder, overrides)
    }

    fn layer(builder: ConfigBuilder<DefaultState>, overrides: &Overrides) -> Result<Self> {
        let mut builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("listen_ip", overrides.listen_ip.map(|ip| ip.to_string()))?
            .set_override_option("control_port", overrides.control_port.map(u64::from))?
            .set_override_option("proxy_host", overrides.proxy_host.clone())?
            .set_override_option("proxy_port", overrides.proxy_port.map(u64::from))?
            .set_override_option("https_proxy", overrides.https_proxy.clone())?;
        if overrides.debug {
            builder = builder.set_override("debug", true)?;
        }

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port.unwrap_or(self.control_port)
    }

    pub fn manager_config(&self) -> Result<ManagerConfig> {
        let https_proxy = self
            .https_proxy
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(Url::parse)
            .transpose()
            .context("Invalid https_proxy URL")?;

        Ok(ManagerConfig {
            listen_ip: self.listen_ip,
            proxy_host: self.proxy_host.clone(),
            proxy_port: self.proxy_port(),
            ports: PortRange {
                min: self.ports.min,
                max: self.ports.max,
                pool_size: self.ports.pool_size,
                max_attempts: self.ports.max_attempts,
            },
            idle_timeout: seconds(self.timeouts.idle),
            console_idle_timeout: seconds(self.timeouts.console_idle),
            console_apps: self.console_apps.clone(),
            handshake_timeout: Duration::from_secs(self.timeouts.handshake.max(1)),
            retry_limit: self.retry_limit,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            https_proxy,
        })
    }

    /// Credentials from the `[credentials]` table, if present.
    pub fn startup_credentials(&self) -> Result<Option<Credentials>> {
        let Some(settings) = &self.credentials else {
            return Ok(None);
        };
        let endpoint = Url::parse(&settings.endpoint)
            .with_context(|| format!("Invalid credentials endpoint {:?}", settings.endpoint))?;
        let api_version = settings
            .api_version
            .clone()
            .unwrap_or_else(|| self.api_version.clone());
        Ok(Some(
            Credentials::new(&settings.access_key, &settings.secret_key, endpoint)
                .with_api_version(api_version),
        ))
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
