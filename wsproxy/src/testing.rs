//! In-process stand-ins for the cluster gateway.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use url::Url;

use crate::credentials::{AuthMode, Credentials, SessionHeader};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct MockGateway {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub fn endpoint(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new("AKTEST", "secret", self.endpoint())
    }

    pub fn session_credentials(&self, token: &str) -> Credentials {
        self.credentials().with_auth_mode(AuthMode::Session {
            token: token.to_string(),
            header: SessionHeader::SessionId,
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Accepts WebSocket upgrades and echoes every data frame back.
    pub async fn echo() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let callback = move |request: &Request, response: Response| {
                        recorded.lock().unwrap().push(record(request));
                        Ok::<Response, ErrorResponse>(response)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        return;
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        if message.is_close() {
                            break;
                        }
                        if (message.is_binary() || message.is_text())
                            && ws.send(message).await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// Rejects every handshake with `status`.
    pub async fn rejecting(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                tokio::spawn(reject(stream, status, recorded));
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record(request: &Request) -> RecordedRequest {
    RecordedRequest {
        uri: request.uri().to_string(),
        headers: request
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect(),
    }
}

/// Reads a request head. Callers only send one before waiting for a reply.
async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Some(String::from_utf8_lossy(&head).to_string())
}

async fn reject(
    mut stream: TcpStream,
    status: u16,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Option<()> {
    let head = read_head(&mut stream).await?;
    let mut lines = head.split("\r\n");
    let uri = lines.next()?.split_whitespace().nth(1)?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    recorded.lock().unwrap().push(RecordedRequest { uri, headers });

    let response = format!(
        "HTTP/1.1 {} Rejected\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    stream.write_all(response.as_bytes()).await.ok()?;
    let _ = stream.shutdown().await;
    Some(())
}

/// An HTTP proxy that understands `CONNECT` only.
pub(crate) struct MockProxy {
    pub addr: SocketAddr,
    request_lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockProxy {
    /// Tunnels every `CONNECT` to the requested authority.
    pub async fn connecting() -> Self {
        Self::spawn(None).await
    }

    /// Answers every `CONNECT` with `status`.
    pub async fn refusing(status: u16) -> Self {
        Self::spawn(Some(status)).await
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.request_lines.lock().unwrap().clone()
    }

    async fn spawn(refusal: Option<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let request_lines = Arc::new(Mutex::new(Vec::new()));

        let recorded = request_lines.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(proxy_connection(stream, refusal, recorded.clone()));
            }
        });

        Self {
            addr,
            request_lines,
            task,
        }
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn proxy_connection(
    mut stream: TcpStream,
    refusal: Option<u16>,
    recorded: Arc<Mutex<Vec<String>>>,
) -> Option<()> {
    let head = read_head(&mut stream).await?;
    let request_line = head.lines().next()?.to_string();
    recorded.lock().unwrap().push(request_line.clone());

    if let Some(status) = refusal {
        let response = format!("HTTP/1.1 {} Refused\r\nContent-Length: 0\r\n\r\n", status);
        stream.write_all(response.as_bytes()).await.ok()?;
        let _ = stream.shutdown().await;
        return Some(());
    }

    let authority = request_line.split_whitespace().nth(1)?.to_string();
    let mut upstream = TcpStream::connect(authority).await.ok()?;
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .ok()?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await.ok()?;
    Some(())
}

/// Reads from `stream` until the peer closes it.
pub(crate) async fn read_until_close(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    String::from_utf8_lossy(&out).to_string()
}
