//! Control API served by `wsproxy serve`.
//!
//! Errors from the manager are reported in the JSON `code` field of an
//! HTTP 200 response. Only unknown routes and redirects use the HTTP
//! status line.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;
use wsproxy::{AppRequest, AuthMode, Credentials, Manager, ManagerError, SessionHeader, TunnelInfo};

/// Token handed back from `PUT /conf`. The daemon only serves local callers.
pub const LOCAL_TOKEN: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfRequest {
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// `"session"` to authenticate with a login session token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_header: Option<SessionHeader>,
}

impl ConfRequest {
    fn into_credentials(self, default_api_version: &str) -> Result<Credentials, String> {
        let endpoint = Url::parse(&self.endpoint)
            .map_err(|e| format!("invalid endpoint {:?}: {}", self.endpoint, e))?;
        let auth_mode = match self.mode.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("signature") | Some("api") => AuthMode::Signature,
            Some("session") => AuthMode::Session {
                token: self
                    .session
                    .filter(|token| !token.is_empty())
                    .ok_or("session mode requires a session token")?,
                header: self.session_header.unwrap_or_default(),
            },
            Some(other) => return Err(format!("unknown auth mode {:?}", other)),
        };
        Ok(Credentials::new(self.access_key, self.secret_key, endpoint)
            .with_api_version(
                self.api_version
                    .unwrap_or_else(|| default_api_version.to_string()),
            )
            .with_auth_mode(auth_mode))
    }
}

#[derive(Debug, Clone)]
pub struct ControlApi {
    manager: Arc<Manager>,
    api_version: String,
}

type Params = HashMap<String, String>;

impl ControlApi {
    pub fn new(manager: Arc<Manager>, api_version: impl Into<String>) -> Self {
        Self {
            manager,
            api_version: api_version.into(),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();
        let params: Params = parts
            .uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let segments: Vec<&str> = parts
            .uri
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        debug!("{} {}", parts.method, parts.uri);

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, []) => self.index(),
            (&Method::PUT, ["conf"]) => match body.collect().await {
                Ok(collected) => self.configure(&collected.to_bytes()),
                Err(e) => reply(json!({ "code": 400, "error": e.to_string() })),
            },
            (&Method::GET, ["proxy", "local", session_id]) => {
                self.query(session_id, params.get("app")).await
            }
            (&Method::GET, ["proxy", "local", session_id, "add"]) => {
                self.add(session_id, &params).await
            }
            (&Method::GET, ["proxy", "local", session_id, "delete"]) => {
                self.delete(session_id, params.get("app")).await
            }
            (&Method::GET, ["redirect"]) => self.redirect(&params),
            _ => respond(
                StatusCode::NOT_FOUND,
                json!({ "code": 404, "error": "no such route" }),
            ),
        }
    }

    fn index(&self) -> Response<Full<Bytes>> {
        reply(json!({
            "code": 200,
            "version": env!("CARGO_PKG_VERSION"),
            "configured": self.manager.is_configured(),
            "tunnels": self.manager.tunnel_count(),
        }))
    }

    fn configure(&self, body: &[u8]) -> Response<Full<Bytes>> {
        let credentials = serde_json::from_slice::<ConfRequest>(body)
            .map_err(|e| e.to_string())
            .and_then(|conf| conf.into_credentials(&self.api_version));
        match credentials {
            Ok(credentials) => {
                self.manager.set_credentials(credentials);
                reply(json!({ "code": 200, "token": LOCAL_TOKEN }))
            }
            Err(e) => {
                warn!("Rejected configuration: {}", e);
                reply(json!({ "code": 400, "error": e }))
            }
        }
    }

    async fn query(&self, session_id: &str, app: Option<&String>) -> Response<Full<Bytes>> {
        let tunnels = match self.manager.session_tunnels(session_id).await {
            Ok(tunnels) => tunnels,
            Err(e) => return error_reply(e),
        };
        let tunnels: Vec<TunnelInfo> = tunnels
            .into_iter()
            .filter(|tunnel| app.is_none_or(|app| &tunnel.app == app))
            .collect();
        if tunnels.is_empty() {
            return reply(json!({ "code": 404 }));
        }
        reply(json!({ "code": 200, "tunnels": tunnels }))
    }

    async fn add(&self, session_id: &str, params: &Params) -> Response<Full<Bytes>> {
        let request = match app_request(params) {
            Ok(request) => request,
            Err(e) => return reply(json!({ "code": 400, "error": e })),
        };
        match self.manager.create_tunnel(session_id, request).await {
            Ok(info) => reply(json!({
                "code": 200,
                "proxy": info.proxy_url,
                "url": info.redirect_url,
                "port": info.port,
                "created": info.created,
            })),
            Err(e) => error_reply(e),
        }
    }

    async fn delete(&self, session_id: &str, app: Option<&String>) -> Response<Full<Bytes>> {
        let result = match app {
            Some(app) => self.manager.delete_tunnel(session_id, app).await.map(|()| 1),
            None => self.manager.delete_session(session_id).await,
        };
        match result {
            Ok(deleted) => reply(json!({ "code": 200, "deleted": deleted })),
            Err(e) => error_reply(e),
        }
    }

    fn redirect(&self, params: &Params) -> Response<Full<Bytes>> {
        let Some(port) = params.get("port").and_then(|port| port.parse::<u16>().ok()) else {
            return reply(json!({ "code": 400, "error": "missing or invalid port" }));
        };
        let path = params.get("redirect").map(String::as_str).unwrap_or("");
        let location = format!(
            "http://{}:{}/{}",
            self.manager.config().proxy_host,
            port,
            path.trim_start_matches('/'),
        );
        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, location)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| internal_error())
    }
}

fn app_request(params: &Params) -> Result<AppRequest, String> {
    let app = params
        .get("app")
        .filter(|app| !app.is_empty())
        .ok_or("missing app")?;
    let mut request = AppRequest::new(app);
    if let Some(envs) = params.get("envs").filter(|envs| !envs.is_empty()) {
        request.envs = serde_json::from_str::<BTreeMap<String, String>>(envs)
            .map_err(|e| format!("envs must be a JSON object of strings: {}", e))?;
    }
    if let Some(arguments) = params
        .get("args")
        .or_else(|| params.get("arguments"))
        .filter(|arguments| !arguments.is_empty())
    {
        request.arguments = serde_json::from_str::<Vec<String>>(arguments)
            .map_err(|e| format!("args must be a JSON array of strings: {}", e))?;
    }
    Ok(request)
}

fn error_reply(error: ManagerError) -> Response<Full<Bytes>> {
    let code = match &error {
        ManagerError::Unauthenticated => 401,
        ManagerError::NotFound(_) => 404,
        ManagerError::InvalidRequest(_) => 400,
        ManagerError::PortInUse { .. } | ManagerError::Port(_) => 503,
        ManagerError::ListenerAborted => 500,
    };
    debug!("Request failed with {}: {}", code, error);
    reply(json!({ "code": code, "error": error.to_string() }))
}

fn reply(body: Value) -> Response<Full<Bytes>> {
    respond(StatusCode::OK, body)
}

fn respond(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| internal_error())
}

fn internal_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Serves `api` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    api: ControlApi,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let api = Arc::new(api);
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("Control API shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    continue;
                }
            },
        };

        let api = api.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let api = api.clone();
                async move { Ok::<_, Infallible>(api.handle(req).await) }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Control connection from {} ended: {}", peer, e);
            }
        });
    }
}
