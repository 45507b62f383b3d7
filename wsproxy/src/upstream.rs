//! Gateway stream endpoints: app classification and URL construction.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::credentials::{Credentials, parse_api_major};

/// Apps that speak a raw TCP protocol instead of HTTP.
pub const TCP_APPS: [&str; 4] = ["vnc", "xrdp", "sshd", "vscode-desktop"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    TcpProxy,
    HttpProxy,
}

impl EndpointKind {
    pub fn classify(app: &str) -> Self {
        if TCP_APPS.contains(&app) {
            Self::TcpProxy
        } else {
            Self::HttpProxy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpProxy => "tcpproxy",
            Self::HttpProxy => "httpproxy",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to launch on the session side. `envs` is ordered so that the
/// encoded query string, and therefore the request signature, is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequest {
    pub app: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl AppRequest {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn kind(&self) -> EndpointKind {
        EndpointKind::classify(&self.app)
    }
}

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Endpoint scheme '{0}' is not http(s) or ws(s)")]
    UnsupportedScheme(String),

    #[error("Failed to encode launch options")]
    Encode(#[from] serde_json::Error),
}

/// The resolved upstream of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub url: Url,
    pub kind: EndpointKind,
}

impl UpstreamTarget {
    pub fn build(
        endpoint: &Url,
        api_version: &str,
        session_id: &str,
        request: &AppRequest,
    ) -> Result<Self, UrlError> {
        let mut url = endpoint.clone();
        let scheme = match endpoint.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        };
        // Both schemes are "special" in the URL standard, so this cannot fail.
        let _ = url.set_scheme(scheme);

        let segment = if parse_api_major(api_version) > 4 {
            "session"
        } else {
            "kernel"
        };
        let kind = request.kind();
        let base_path = endpoint.path().trim_end_matches('/');
        url.set_path(&format!(
            "{}/stream/{}/{}/{}",
            base_path, segment, session_id, kind
        ));
        url.set_fragment(None);
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("app", &request.app);
            if !request.envs.is_empty() {
                query.append_pair("envs", &serde_json::to_string(&request.envs)?);
            }
            if !request.arguments.is_empty() {
                query.append_pair("arguments", &serde_json::to_string(&request.arguments)?);
            }
        }

        Ok(Self { url, kind })
    }

    pub fn for_credentials(
        credentials: &Credentials,
        session_id: &str,
        request: &AppRequest,
    ) -> Result<Self, UrlError> {
        Self::build(
            &credentials.endpoint,
            &credentials.api_version,
            session_id,
            request,
        )
    }

    /// Path plus query, the part of the URL covered by the signature.
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("localhost")
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// `Host` header value; the port is included only when it is not the default.
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.host(), port),
            None => self.host().to_string(),
        }
    }
}
