use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use url::Url;

use crate::api::ConfRequest;

/// Talks to a running `wsproxy serve` over its control API.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base: Url,
}

impl ControlClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid control path {}", path))
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .get(self.url(path)?)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to reach wsproxy at {}", self.base))?;
        parse(response).await
    }

    pub async fn configure(&self, conf: &ConfRequest) -> Result<Value> {
        let response = self
            .http
            .put(self.url("conf")?)
            .json(conf)
            .send()
            .await
            .with_context(|| format!("Failed to reach wsproxy at {}", self.base))?;
        parse(response).await
    }

    pub async fn add(
        &self,
        session_id: &str,
        app: &str,
        envs: &BTreeMap<String, String>,
        arguments: &[String],
    ) -> Result<Value> {
        let envs = serde_json::to_string(envs)?;
        let arguments = serde_json::to_string(arguments)?;
        self.get(
            &format!("proxy/local/{}/add", session_id),
            &[("app", app), ("envs", &envs), ("args", &arguments)],
        )
        .await
    }

    pub async fn delete(&self, session_id: &str, app: Option<&str>) -> Result<Value> {
        let query: Vec<(&str, &str)> = app.map(|app| ("app", app)).into_iter().collect();
        self.get(&format!("proxy/local/{}/delete", session_id), &query)
            .await
    }

    pub async fn status(&self, session_id: &str, app: Option<&str>) -> Result<Value> {
        let query: Vec<(&str, &str)> = app.map(|app| ("app", app)).into_iter().collect();
        self.get(&format!("proxy/local/{}", session_id), &query)
            .await
    }
}

async fn parse(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("wsproxy answered {} - {}", status, body);
    }
    let value: Value = response
        .json()
        .await
        .context("Failed to parse control API response")?;

    match value["code"].as_u64() {
        Some(200) | None => Ok(value),
        Some(401) => bail!("wsproxy has no credentials yet. Run 'wsproxy configure' first."),
        Some(code) => {
            let fallback = if code == 404 {
                "no matching tunnel"
            } else {
                "request failed"
            };
            let error = value["error"].as_str().unwrap_or(fallback);
            bail!("wsproxy answered {}: {}", code, error)
        }
    }
}
