use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::sign::{HmacSigner, RequestSigner, SessionSigner};

pub const DEFAULT_API_VERSION: &str = "v6.20220615";

/// How the upstream handshake is authenticated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthMode {
    /// HMAC-SHA256 request signature derived from the keypair.
    Signature,
    /// A login session token issued by the gateway.
    Session {
        token: String,
        #[serde(default)]
        header: SessionHeader,
    },
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signature => f.write_str("Signature"),
            Self::Session { header, .. } => f
                .debug_struct("Session")
                .field("header", header)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionHeader {
    #[default]
    Cookie,
    SessionId,
}

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Url,
    pub api_version: String,
    pub auth_mode: AuthMode,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("endpoint", &self.endpoint.as_str())
            .field("api_version", &self.api_version)
            .field("auth_mode", &self.auth_mode)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>, endpoint: Url) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            endpoint,
            api_version: DEFAULT_API_VERSION.to_string(),
            auth_mode: AuthMode::Signature,
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: AuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    /// Major number of the API version, `v6.20220615` -> 6.
    pub fn api_major(&self) -> u32 {
        parse_api_major(&self.api_version)
    }

    /// Host (and explicit port) of the gateway endpoint as used in signatures.
    pub fn endpoint_host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn signer(&self) -> Arc<dyn RequestSigner> {
        match &self.auth_mode {
            AuthMode::Signature => Arc::new(HmacSigner::new(
                &self.access_key,
                &self.secret_key,
                self.endpoint_host(),
                &self.api_version,
            )),
            AuthMode::Session { token, header } => Arc::new(SessionSigner::new(token, *header)),
        }
    }
}

pub fn parse_api_major(version: &str) -> u32 {
    version
        .trim_start_matches(['v', 'V'])
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

/// The manager's view of authentication: either nothing has been
/// configured yet or a full credential set is active.
#[derive(Debug, Clone, Default)]
pub enum CredentialState {
    #[default]
    Unconfigured,
    Configured(Arc<Credentials>),
}

impl CredentialState {
    pub fn credentials(&self) -> Option<&Arc<Credentials>> {
        match self {
            Self::Unconfigured => None,
            Self::Configured(creds) => Some(creds),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }
}
