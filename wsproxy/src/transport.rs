//! Upstream WebSocket transport: dialing, handshake and byte-stream adapters.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::HeaderMap;
use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls};
use tracing::{debug, trace};
use url::Url;

use crate::bind::Leg;
use crate::upstream::UpstreamTarget;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_PROXY_RESPONSE: usize = 8192;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Gateway rejected the handshake with status {status}")]
    Handshake { status: StatusCode },

    #[error("Timed out after {0:?} connecting to the gateway")]
    Timeout(Duration),

    #[error("Proxy refused CONNECT: {0}")]
    Proxy(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(WsError),

    #[error("Failed to build handshake request")]
    Request(#[from] http::Error),
}

impl From<WsError> for UpstreamError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Http(response) => Self::Handshake {
                status: response.status(),
            },
            WsError::Io(e) => Self::Transport(e),
            other => Self::WebSocket(other),
        }
    }
}

/// Opens upstream WebSocket connections, optionally through an HTTP proxy.
#[derive(Debug, Clone)]
pub struct Dialer {
    proxy: Option<Url>,
    timeout: Duration,
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            proxy: None,
            timeout,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<Url>) -> Self {
        self.proxy = proxy;
        self
    }

    pub async fn connect(
        &self,
        target: &UpstreamTarget,
        headers: HeaderMap,
    ) -> Result<WsStream, UpstreamError> {
        match tokio::time::timeout(self.timeout, self.connect_inner(target, headers)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }

    async fn connect_inner(
        &self,
        target: &UpstreamTarget,
        headers: HeaderMap,
    ) -> Result<WsStream, UpstreamError> {
        let stream = match &self.proxy {
            Some(proxy) => open_proxy_tunnel(proxy, target.host(), target.port()).await?,
            None => TcpStream::connect((target.host(), target.port())).await?,
        };
        stream.set_nodelay(true)?;

        let mut request = http::Request::builder()
            .uri(target.url.as_str())
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", target.authority());
        if let Some(request_headers) = request.headers_mut() {
            request_headers.extend(headers);
        }
        let request = request.body(())?;

        let (ws_stream, response) = client_async_tls(request, stream).await?;
        debug!("Upstream {} upgraded ({})", target.url, response.status());
        Ok(ws_stream)
    }
}

/// Establishes a raw TCP tunnel to `host:port` through an HTTP proxy.
async fn open_proxy_tunnel(proxy: &Url, host: &str, port: u16) -> Result<TcpStream, UpstreamError> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| UpstreamError::Proxy(format!("no host in proxy URL {}", proxy)))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(3128);
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let authority = format!("{}:{}", host, port);
    let connect = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read byte by byte so nothing past the header block is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(UpstreamError::Proxy("connection closed during CONNECT".into()));
        }
        head.push(byte[0]);
        if head.len() > MAX_PROXY_RESPONSE {
            return Err(UpstreamError::Proxy("oversized CONNECT response".into()));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => {
            trace!("Proxy {} tunnelled to {}", proxy_host, authority);
            Ok(stream)
        }
        _ => Err(UpstreamError::Proxy(status_line.to_string())),
    }
}

/// Inbound half of a WebSocket as a stream of byte chunks.
pub struct WsReader<S> {
    inner: S,
}

impl<S> Stream for WsReader<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(WsMessage::Binary(data))) => return Poll::Ready(Some(Ok(data))),
                Some(Ok(WsMessage::Text(text))) => {
                    return Poll::Ready(Some(Ok(Bytes::copy_from_slice(text.as_bytes()))));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    trace!("Upstream sent close: {:?}", frame);
                    return Poll::Ready(None);
                }
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Some(Err(io::Error::other(e)))),
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Outbound half of a WebSocket accepting byte chunks as binary frames.
pub struct WsWriter<S> {
    inner: S,
}

impl<S> Sink<Bytes> for WsWriter<S>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_ready_unpin(cx).map_err(io::Error::other)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        self.inner
            .start_send_unpin(WsMessage::Binary(item))
            .map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_flush_unpin(cx).map_err(io::Error::other)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.poll_close_unpin(cx).map_err(io::Error::other)
    }
}

pub type WsLeg = Leg<WsReader<SplitStream<WsStream>>, WsWriter<SplitSink<WsStream, WsMessage>>>;

pub fn ws_leg(name: &'static str, ws: WsStream) -> WsLeg {
    let (sink, stream) = ws.split();
    Leg::new(name, WsReader { inner: stream }, WsWriter { inner: sink })
}
