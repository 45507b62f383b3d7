//! Authentication headers for upstream requests.

use std::fmt::Debug;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::credentials::SessionHeader;

type HmacSha256 = Hmac<Sha256>;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const USER_AGENT_VALUE: &str = concat!("Backend.AI wsproxy/", env!("CARGO_PKG_VERSION"));

const X_BACKENDAI_VERSION: HeaderName = HeaderName::from_static("x-backendai-version");
const X_BACKENDAI_DATE: HeaderName = HeaderName::from_static("x-backendai-date");
const X_BACKENDAI_SESSION_ID: HeaderName = HeaderName::from_static("x-backendai-sessionid");

#[derive(Debug, Error)]
pub enum SignError {
    #[error("Header value for {0} contains invalid characters")]
    InvalidHeader(&'static str),
}

/// Everything that goes into a signature. The date is an input so the
/// output is reproducible.
#[derive(Debug, Clone)]
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
    pub date: DateTime<Utc>,
}

impl<'a> SigningRequest<'a> {
    pub fn get(path_and_query: &'a str, date: DateTime<Utc>) -> Self {
        Self {
            method: "GET",
            path_and_query,
            content_type: JSON_CONTENT_TYPE,
            body: &[],
            date,
        }
    }
}

pub trait RequestSigner: Debug + Send + Sync {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<HeaderMap, SignError>;
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, SignError> {
    HeaderValue::from_str(value).map_err(|_| SignError::InvalidHeader(name))
}

fn hmac(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

pub struct HmacSigner {
    access_key: String,
    secret_key: String,
    endpoint_host: String,
    api_version: String,
}

impl Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("access_key", &self.access_key)
            .field("endpoint_host", &self.endpoint_host)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl HmacSigner {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        endpoint_host: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            endpoint_host: endpoint_host.into(),
            api_version: api_version.into(),
        }
    }

    pub fn canonical_string(&self, request: &SigningRequest<'_>) -> String {
        let body_hash = hex::encode(Sha256::digest(request.body));
        format!(
            "{}\n{}\n{}\nhost:{}\ncontent-type:{}\nx-backendai-version:{}\n{}",
            request.method.to_ascii_uppercase(),
            request.path_and_query,
            format_date(&request.date),
            self.endpoint_host,
            request.content_type,
            self.api_version,
            body_hash,
        )
    }

    /// Key derivation: the secret is first bound to the day, then to the host.
    fn sign_key(&self, date: &DateTime<Utc>) -> Vec<u8> {
        let day = date.format("%Y%m%d").to_string();
        let k1 = hmac(self.secret_key.as_bytes(), day.as_bytes());
        hmac(&k1, self.endpoint_host.as_bytes())
    }

    pub fn signature(&self, request: &SigningRequest<'_>) -> String {
        let key = self.sign_key(&request.date);
        hex::encode(hmac(&key, self.canonical_string(request).as_bytes()))
    }
}

impl RequestSigner for HmacSigner {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<HeaderMap, SignError> {
        let authorization = format!(
            "BackendAI signMethod=HMAC-SHA256, credential={}:{}",
            self.access_key,
            self.signature(request)
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value("Content-Type", request.content_type)?);
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(
            X_BACKENDAI_VERSION,
            header_value("X-BackendAI-Version", &self.api_version)?,
        );
        headers.insert(
            X_BACKENDAI_DATE,
            header_value("X-BackendAI-Date", &format_date(&request.date))?,
        );
        headers.insert(AUTHORIZATION, header_value("Authorization", &authorization)?);
        Ok(headers)
    }
}

pub struct SessionSigner {
    token: String,
    header: SessionHeader,
}

impl Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl SessionSigner {
    pub fn new(token: impl Into<String>, header: SessionHeader) -> Self {
        Self {
            token: token.into(),
            header,
        }
    }
}

impl RequestSigner for SessionSigner {
    fn sign(&self, request: &SigningRequest<'_>) -> Result<HeaderMap, SignError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value("Content-Type", request.content_type)?);
        match self.header {
            SessionHeader::Cookie => {
                let cookie = format!("AIOHTTP_SESSION={}", self.token);
                headers.insert(COOKIE, header_value("Cookie", &cookie)?);
            }
            SessionHeader::SessionId => {
                headers.insert(
                    X_BACKENDAI_SESSION_ID,
                    header_value("X-BackendAI-SessionID", &self.token)?,
                );
            }
        }
        Ok(headers)
    }
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}
