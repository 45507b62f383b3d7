//! A tunnel session: one local listener forwarding every accepted
//! connection to one app of one compute session.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::StatusCode;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bind::{BindOptions, bind, io_leg};
use crate::page::{self, Page};
use crate::port::PortLease;
use crate::sign::{RequestSigner, SigningRequest};
use crate::transport::{Dialer, UpstreamError, WsStream, ws_leg};
use crate::upstream::{EndpointKind, UpstreamTarget};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    pub session_id: String,
    pub app: String,
}

impl TunnelKey {
    pub fn new(session_id: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            app: app.into(),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.app)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Listening(SocketAddr),
    Stopped,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind {addr}: {source}")]
    PortInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listener task ended before the port was bound")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Close a bridged connection after this long without traffic.
    pub idle_timeout: Option<Duration>,
    /// How many times a 500 from the gateway is retried per connection.
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub dialer: Dialer,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(60)),
            retry_limit: 5,
            retry_delay: Duration::from_secs(1),
            dialer: Dialer::new(Duration::from_secs(10)),
        }
    }
}

struct Forwarder {
    key: TunnelKey,
    upstream: UpstreamTarget,
    signer: Arc<dyn RequestSigner>,
    options: TunnelOptions,
}

pub struct Tunnel {
    key: TunnelKey,
    local_addr: SocketAddr,
    upstream: UpstreamTarget,
    created_at: DateTime<Utc>,
    state: watch::Receiver<TunnelState>,
    cancel: CancellationToken,
    connections: TaskTracker,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .field("upstream", &self.upstream.url.as_str())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Tunnel {
    /// Binds `bind_addr` and starts accepting. Resolves once the listener is
    /// confirmed bound, or with [`TunnelError::PortInUse`] if binding failed.
    ///
    /// `lease` is held by the listener task and dropped only after the
    /// listener is closed, also when this future is dropped mid-way.
    pub async fn listen(
        key: TunnelKey,
        bind_addr: SocketAddr,
        lease: Option<PortLease>,
        upstream: UpstreamTarget,
        signer: Arc<dyn RequestSigner>,
        options: TunnelOptions,
    ) -> Result<Self, TunnelError> {
        let (state_tx, state_rx) = watch::channel(TunnelState::Created);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();
        // Stops the listener task unless a `Tunnel` takes ownership of it.
        let abandoned = cancel.clone().drop_guard();

        let forwarder = Arc::new(Forwarder {
            key: key.clone(),
            upstream: upstream.clone(),
            signer,
            options,
        });
        let acceptor = tokio::spawn(accept_loop(
            bind_addr,
            lease,
            forwarder,
            state_tx,
            ready_tx,
            cancel.clone(),
            connections.clone(),
        ));

        let local_addr = match ready_rx.await {
            Ok(Ok(addr)) => addr,
            Ok(Err(source)) => {
                return Err(TunnelError::PortInUse {
                    addr: bind_addr,
                    source,
                });
            }
            Err(_) => return Err(TunnelError::Aborted),
        };
        abandoned.disarm();
        info!("Tunnel {} listening on {} -> {}", key, local_addr, upstream.url);

        Ok(Self {
            key,
            local_addr,
            upstream,
            created_at: Utc::now(),
            state: state_rx,
            cancel,
            connections,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn upstream(&self) -> &UpstreamTarget {
        &self.upstream
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stops accepting, then closes every open connection. When this returns
    /// the port is released and no connection is still bridged.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(acceptor) = acceptor {
            if let Err(e) = acceptor.await {
                error!("Tunnel {} acceptor panicked: {}", self.key, e);
            }
        }
        self.connections.close();
        self.connections.wait().await;
        info!("Tunnel {} stopped", self.key);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    bind_addr: SocketAddr,
    lease: Option<PortLease>,
    forwarder: Arc<Forwarder>,
    state: watch::Sender<TunnelState>,
    ready: oneshot::Sender<io::Result<SocketAddr>>,
    cancel: CancellationToken,
    connections: TaskTracker,
) {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    state.send_replace(TunnelState::Listening(local_addr));
    if ready.send(Ok(local_addr)).is_err() {
        // Creation was abandoned; nobody owns this listener.
        state.send_replace(TunnelState::Stopped);
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Tunnel {}: accepted {}", forwarder.key, peer);
                    connections.spawn(handle_connection(
                        socket,
                        peer,
                        forwarder.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    warn!("Tunnel {}: accept failed: {}", forwarder.key, e);
                }
            },
        }
    }

    drop(listener);
    drop(lease);
    state.send_replace(TunnelState::Stopped);
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    forwarder: Arc<Forwarder>,
    cancel: CancellationToken,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("{}: set_nodelay failed: {}", peer, e);
    }

    let ws = tokio::select! {
        _ = cancel.cancelled() => return,
        ws = forwarder.establish(&mut socket, peer) => ws,
    };
    let Some(ws) = ws else {
        return;
    };

    debug!("Tunnel {}: {} bridged", forwarder.key, peer);
    let report = bind(
        io_leg("local", socket),
        ws_leg("upstream", ws),
        BindOptions {
            idle_timeout: forwarder.options.idle_timeout,
            cancel,
        },
    )
    .await;
    debug!(
        "Tunnel {}: {} closed ({:?}, {} bytes up, {} bytes down)",
        forwarder.key, peer, report.reason, report.a_to_b, report.b_to_a
    );
}

impl Forwarder {
    /// Negotiates the upstream WebSocket. On failure a canned response has
    /// already been written to `socket` and `None` is returned.
    async fn establish(&self, socket: &mut TcpStream, peer: SocketAddr) -> Option<WsStream> {
        let path = self.upstream.path_and_query();
        let mut retries = 0;

        loop {
            let headers = match self.signer.sign(&SigningRequest::get(&path, Utc::now())) {
                Ok(headers) => headers,
                Err(e) => {
                    warn!("Tunnel {}: cannot sign request: {}", self.key, e);
                    respond(socket, &Page::Unauthorized.render()).await;
                    return None;
                }
            };

            let err = match self.options.dialer.connect(&self.upstream, headers).await {
                Ok(ws) => return Some(ws),
                Err(err) => err,
            };

            let page = match err {
                UpstreamError::Handshake { status }
                    if status == StatusCode::INTERNAL_SERVER_ERROR
                        && retries < self.options.retry_limit =>
                {
                    retries += 1;
                    debug!(
                        "Tunnel {}: app not ready for {} (retry {}/{})",
                        self.key, peer, retries, self.options.retry_limit
                    );
                    // Raw TCP protocols cannot carry an HTTP interim response.
                    if self.upstream.kind == EndpointKind::HttpProxy
                        && socket.write_all(page::CONTINUE).await.is_err()
                    {
                        return None;
                    }
                    tokio::time::sleep(self.options.retry_delay).await;
                    continue;
                }
                UpstreamError::Handshake { status } => {
                    if status == StatusCode::BAD_GATEWAY {
                        warn!("Tunnel {}: gateway returned 502 for {}", self.key, peer);
                    } else {
                        debug!("Tunnel {}: handshake rejected with {}", self.key, status);
                    }
                    Page::for_status(status)
                }
                UpstreamError::Timeout(after) => {
                    warn!("Tunnel {}: gateway timed out after {:?}", self.key, after);
                    Page::GatewayTimeout
                }
                other => {
                    warn!("Tunnel {}: upstream connect failed: {}", self.key, other);
                    Page::BadGateway
                }
            };

            respond(socket, &page.render()).await;
            return None;
        }
    }
}

async fn respond(socket: &mut TcpStream, response: &[u8]) {
    if let Err(e) = socket.write_all(response).await {
        debug!("Failed to write response: {}", e);
        return;
    }
    let _ = socket.shutdown().await;
}
