//! Control plane: owns the tunnel registry, the port allocator and the
//! active credentials.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::{CredentialState, Credentials};
use crate::port::{PortAllocator, PortError, PortRange};
use crate::transport::Dialer;
use crate::tunnel::{Tunnel, TunnelError, TunnelKey, TunnelOptions};
use crate::upstream::{AppRequest, UpstreamTarget};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Credentials have not been configured")]
    Unauthenticated,

    #[error("Port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("No tunnel for {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tunnel listener aborted before binding")]
    ListenerAborted,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Address every tunnel listener binds to.
    pub listen_ip: IpAddr,
    /// Host placed in the proxy URLs handed back to callers.
    pub proxy_host: String,
    /// Port of the control API as seen by callers, used for redirect URLs.
    pub proxy_port: u16,
    pub ports: PortRange,
    pub idle_timeout: Option<Duration>,
    pub console_idle_timeout: Option<Duration>,
    /// Apps that get `console_idle_timeout` instead of `idle_timeout`.
    pub console_apps: Vec<String>,
    pub handshake_timeout: Duration,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub https_proxy: Option<Url>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 5050,
            ports: PortRange::default(),
            idle_timeout: Some(Duration::from_secs(60)),
            console_idle_timeout: Some(Duration::from_secs(30)),
            console_apps: vec!["ttyd".to_string()],
            handshake_timeout: Duration::from_secs(10),
            retry_limit: 5,
            retry_delay: Duration::from_secs(1),
            https_proxy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub session_id: String,
    pub app: String,
    pub port: u16,
    pub proxy_url: String,
    pub redirect_url: String,
    pub upstream_url: String,
    pub created_at: DateTime<Utc>,
    pub connections: usize,
    /// `false` when an existing tunnel was returned.
    pub created: bool,
}

/// One registry entry. The async lock serializes creation and deletion of
/// the same key while leaving other keys untouched.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<Tunnel>>>>;

#[derive(Debug)]
pub struct Manager {
    config: ManagerConfig,
    credentials: RwLock<CredentialState>,
    ports: Arc<PortAllocator>,
    registry: Mutex<HashMap<TunnelKey, Slot>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        let ports = PortAllocator::new(config.ports.clone())?.with_probe_ip(config.listen_ip);
        Ok(Self {
            config,
            credentials: RwLock::new(CredentialState::Unconfigured),
            ports: Arc::new(ports),
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Replaces the active credentials. Tunnels that are already running keep
    /// the credentials they were created with; only new tunnels see the change.
    pub fn set_credentials(&self, credentials: Credentials) {
        info!(
            "Credentials set for {} ({:?})",
            credentials.endpoint, credentials.auth_mode
        );
        let mut state = self.credentials.write().unwrap_or_else(|e| e.into_inner());
        *state = CredentialState::Configured(Arc::new(credentials));
    }

    pub fn credential_state(&self) -> CredentialState {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_configured(&self) -> bool {
        self.credential_state().is_configured()
    }

    fn require_credentials(&self) -> Result<Arc<Credentials>, ManagerError> {
        self.credential_state()
            .credentials()
            .cloned()
            .ok_or(ManagerError::Unauthenticated)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TunnelKey, Slot>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, key: &TunnelKey, slot: &Slot) -> bool {
        self.registry()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn discard_slot(&self, key: &TunnelKey, slot: &Slot) {
        let mut registry = self.registry();
        if registry
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            registry.remove(key);
        }
    }

    /// Returns the tunnel for `(session_id, request.app)`, creating and
    /// binding it first if it does not exist yet.
    pub async fn create_tunnel(
        &self,
        session_id: &str,
        request: AppRequest,
    ) -> Result<TunnelInfo, ManagerError> {
        let credentials = self.require_credentials()?;
        if session_id.is_empty() {
            return Err(ManagerError::InvalidRequest("session id is empty".into()));
        }
        if request.app.is_empty() {
            return Err(ManagerError::InvalidRequest("app name is empty".into()));
        }
        let key = TunnelKey::new(session_id, &request.app);

        loop {
            let slot = self.registry().entry(key.clone()).or_default().clone();
            let _vacant = VacantSlot {
                manager: self,
                key: &key,
                slot: slot.clone(),
            };
            let mut guard = slot.lock().await;
            if !self.is_current(&key, &slot) {
                // Deleted while we waited; start over with a fresh slot.
                continue;
            }

            if let Some(tunnel) = guard.as_ref() {
                debug!("Reusing tunnel {} on {}", key, tunnel.local_addr());
                return Ok(self.info(tunnel, false));
            }

            let tunnel = Arc::new(self.spawn_tunnel(&key, &credentials, &request).await?);
            let info = self.info(&tunnel, true);
            *guard = Some(tunnel);
            return Ok(info);
        }
    }

    async fn spawn_tunnel(
        &self,
        key: &TunnelKey,
        credentials: &Credentials,
        request: &AppRequest,
    ) -> Result<Tunnel, ManagerError> {
        let upstream = UpstreamTarget::for_credentials(credentials, &key.session_id, request)
            .map_err(|e| ManagerError::InvalidRequest(e.to_string()))?;
        let lease = self.ports.lease()?;
        let port = lease.port();
        let bind_addr = SocketAddr::new(self.config.listen_ip, port);

        match Tunnel::listen(
            key.clone(),
            bind_addr,
            Some(lease),
            upstream,
            credentials.signer(),
            self.tunnel_options(&key.app),
        )
        .await
        {
            Ok(tunnel) => Ok(tunnel),
            Err(e) => {
                warn!("Tunnel {} failed to listen: {}", key, e);
                Err(match e {
                    TunnelError::PortInUse { source, .. } => ManagerError::PortInUse { port, source },
                    TunnelError::Aborted => ManagerError::ListenerAborted,
                })
            }
        }
    }

    fn tunnel_options(&self, app: &str) -> TunnelOptions {
        let idle_timeout = if self.config.console_apps.iter().any(|a| a == app) {
            self.config.console_idle_timeout
        } else {
            self.config.idle_timeout
        };
        TunnelOptions {
            idle_timeout,
            retry_limit: self.config.retry_limit,
            retry_delay: self.config.retry_delay,
            dialer: Dialer::new(self.config.handshake_timeout)
                .with_proxy(self.config.https_proxy.clone()),
        }
    }

    fn info(&self, tunnel: &Tunnel, created: bool) -> TunnelInfo {
        let port = tunnel.local_addr().port();
        TunnelInfo {
            session_id: tunnel.key().session_id.clone(),
            app: tunnel.key().app.clone(),
            port,
            proxy_url: format!("http://{}:{}", self.config.proxy_host, port),
            redirect_url: format!(
                "http://{}:{}/redirect?port={}",
                self.config.proxy_host, self.config.proxy_port, port
            ),
            upstream_url: tunnel.upstream().url.to_string(),
            created_at: tunnel.created_at(),
            connections: tunnel.active_connections(),
            created,
        }
    }

    /// Stops the tunnel for the key, closing all of its connections.
    pub async fn delete_tunnel(&self, session_id: &str, app: &str) -> Result<(), ManagerError> {
        let key = TunnelKey::new(session_id, app);
        let slot = self
            .registry()
            .get(&key)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(key.to_string()))?;

        let mut guard = slot.lock().await;
        let tunnel = guard.take();
        self.discard_slot(&key, &slot);
        drop(guard);

        let tunnel = tunnel.ok_or_else(|| ManagerError::NotFound(key.to_string()))?;
        // The port lease is returned once the listener closes, even if this
        // future is dropped before `stop` completes.
        tunnel.stop().await;
        Ok(())
    }

    /// Deletes every tunnel of a session and returns how many were stopped.
    pub async fn delete_session(&self, session_id: &str) -> Result<usize, ManagerError> {
        let keys: Vec<TunnelKey> = self
            .registry()
            .keys()
            .filter(|key| key.session_id == session_id)
            .cloned()
            .collect();

        let mut deleted = 0;
        for key in keys {
            match self.delete_tunnel(&key.session_id, &key.app).await {
                Ok(()) => deleted += 1,
                Err(ManagerError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if deleted == 0 {
            return Err(ManagerError::NotFound(session_id.to_string()));
        }
        Ok(deleted)
    }

    pub async fn query_tunnel(&self, session_id: &str, app: &str) -> Result<bool, ManagerError> {
        self.require_credentials()?;
        let slot = self.registry().get(&TunnelKey::new(session_id, app)).cloned();
        Ok(match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        })
    }

    pub async fn query_session(&self, session_id: &str) -> Result<bool, ManagerError> {
        Ok(!self.session_tunnels(session_id).await?.is_empty())
    }

    pub async fn session_tunnels(&self, session_id: &str) -> Result<Vec<TunnelInfo>, ManagerError> {
        self.require_credentials()?;
        let slots: Vec<Slot> = self
            .registry()
            .iter()
            .filter(|(key, _)| key.session_id == session_id)
            .map(|(_, slot)| slot.clone())
            .collect();

        let mut tunnels = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(tunnel) = slot.lock().await.as_ref() {
                tunnels.push(self.info(tunnel, false));
            }
        }
        tunnels.sort_by(|a, b| a.app.cmp(&b.app));
        Ok(tunnels)
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry().len()
    }

    /// Stops every tunnel. Used on process shutdown.
    pub async fn shutdown(&self) {
        let slots: Vec<(TunnelKey, Slot)> = self.registry().drain().collect();
        for (key, slot) in slots {
            if let Some(tunnel) = slot.lock().await.take() {
                debug!("Shutting down tunnel {}", key);
                tunnel.stop().await;
            }
        }
        info!("All tunnels stopped");
    }
}

/// Removes the registry entry of a `create_tunnel` call that leaves its slot
/// empty, whether it failed or was cancelled.
struct VacantSlot<'a> {
    manager: &'a Manager,
    key: &'a TunnelKey,
    slot: Slot,
}

impl Drop for VacantSlot<'_> {
    fn drop(&mut self) {
        // A slot that is still locked belongs to another in-flight call.
        if let Ok(tunnel) = self.slot.try_lock() {
            if tunnel.is_none() {
                self.manager.discard_slot(self.key, &self.slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use futures_util::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::testing::{MockGateway, MockProxy, read_until_close};

    fn config(min: u16, max: u16) -> ManagerConfig {
        ManagerConfig {
            ports: PortRange {
                min,
                max,
                pool_size: 32,
                max_attempts: 32,
            },
            retry_delay: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn rejects_calls_before_credentials() {
        let manager = Manager::new(config(43000, 43100)).unwrap();
        let err = manager
            .create_tunnel("abc", AppRequest::new("jupyter"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Unauthenticated));
        assert!(matches!(
            manager.query_tunnel("abc", "jupyter").await,
            Err(ManagerError::Unauthenticated)
        ));
        assert!(matches!(
            manager.delete_tunnel("abc", "jupyter").await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.delete_session("abc").await,
            Err(ManagerError::NotFound(_))
        ));
    }

    async fn wait_for_release(manager: &Manager, port: u16) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.ports.is_leased(port) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("port lease was never returned");
    }

    #[tokio::test]
    async fn cancelled_create_returns_its_port() {
        let gateway = MockGateway::echo().await;
        let port = free_port();
        let manager = Manager::new(config(port, port)).unwrap();
        manager.set_credentials(gateway.credentials());

        // One poll gets as far as waiting for the listener, then the caller
        // goes away.
        let abandoned = manager
            .create_tunnel("s1", AppRequest::new("jupyter"))
            .now_or_never();
        assert!(abandoned.is_none());
        assert_eq!(manager.tunnel_count(), 0);

        wait_for_release(&manager, port).await;
        let info = manager.create_tunnel("s2", AppRequest::new("jupyter")).await.unwrap();
        assert_eq!(info.port, port);
        assert!(!manager.query_tunnel("s1", "jupyter").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_delete_returns_its_port() {
        let gateway = MockGateway::echo().await;
        let port = free_port();
        let manager = Manager::new(config(port, port)).unwrap();
        manager.set_credentials(gateway.credentials());

        manager.create_tunnel("s1", AppRequest::new("jupyter")).await.unwrap();
        let abandoned = manager.delete_tunnel("s1", "jupyter").now_or_never();
        assert!(abandoned.is_none());
        assert_eq!(manager.tunnel_count(), 0);

        wait_for_release(&manager, port).await;
        let info = manager.create_tunnel("s2", AppRequest::new("jupyter")).await.unwrap();
        assert_eq!(info.port, port);
    }

    #[test]
    fn console_apps_get_the_console_idle_timeout() {
        let manager = Manager::new(ManagerConfig::default()).unwrap();
        assert_eq!(
            manager.tunnel_options("ttyd").idle_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            manager.tunnel_options("jupyter").idle_timeout,
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn idle_console_connections_are_closed() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(ManagerConfig {
            idle_timeout: Some(Duration::from_secs(30)),
            console_idle_timeout: Some(Duration::from_millis(300)),
            ..config(44201, 44299)
        })
        .unwrap();
        manager.set_credentials(gateway.credentials());

        let console = manager.create_tunnel("abc", AppRequest::new("ttyd")).await.unwrap();
        let notebook = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();

        let mut clients = Vec::new();
        for port in [console.port, notebook.port] {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            client.read_exact(&mut buf).await.unwrap();
            clients.push(client);
        }
        let mut notebook_client = clients.pop().unwrap();
        let mut console_client = clients.pop().unwrap();

        let rest = tokio::time::timeout(Duration::from_secs(5), read_until_close(&mut console_client))
            .await
            .expect("idle console connection stayed open");
        assert!(rest.is_empty());

        let mut buf = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_secs(1), notebook_client.read(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn gateway_rejections_reach_the_client_as_pages() {
        for (status, status_line, min) in [
            (401, "HTTP/1.1 401 Unauthorized\r\n", 44301),
            (502, "HTTP/1.1 502 Bad Gateway\r\n", 44401),
        ] {
            let gateway = MockGateway::rejecting(status).await;
            let manager = Manager::new(config(min, min + 98)).unwrap();
            manager.set_credentials(gateway.credentials());

            let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
            let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
            let response = read_until_close(&mut client).await;
            assert!(response.starts_with(status_line), "{}", response);
            assert_eq!(gateway.requests().len(), 1);
        }
    }

    #[tokio::test]
    async fn bridges_through_an_http_proxy() {
        let gateway = MockGateway::echo().await;
        let proxy = MockProxy::connecting().await;
        let manager = Manager::new(ManagerConfig {
            https_proxy: Some(proxy.url()),
            ..config(44501, 44599)
        })
        .unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");

        assert_eq!(
            proxy.request_lines(),
            vec![format!("CONNECT 127.0.0.1:{} HTTP/1.1", gateway.addr.port())]
        );
        assert_eq!(gateway.requests().len(), 1);
    }

    #[tokio::test]
    async fn refused_proxy_yields_bad_gateway() {
        let gateway = MockGateway::echo().await;
        let proxy = MockProxy::refusing(407).await;
        let manager = Manager::new(ManagerConfig {
            https_proxy: Some(proxy.url()),
            ..config(44601, 44699)
        })
        .unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let response = read_until_close(&mut client).await;

        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert_eq!(proxy.request_lines().len(), 1);
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(43100, 43200)).unwrap();
        manager.set_credentials(gateway.credentials());

        let first = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let second = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.port, second.port);
        assert_eq!(manager.tunnel_count(), 1);
        assert_eq!(first.proxy_url, format!("http://127.0.0.1:{}", first.port));
        assert_eq!(
            first.redirect_url,
            format!("http://127.0.0.1:5050/redirect?port={}", first.port)
        );
        assert!(manager.query_tunnel("abc", "jupyter").await.unwrap());
        assert!(!manager.query_tunnel("abc", "ttyd").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_key_share_a_listener() {
        let gateway = MockGateway::echo().await;
        let manager = Arc::new(Manager::new(config(43200, 43300)).unwrap());
        manager.set_credentials(gateway.credentials());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap()
                })
            })
            .collect();

        let mut ports = HashSet::new();
        let mut created = 0;
        for handle in handles {
            let info = handle.await.unwrap();
            ports.insert(info.port);
            created += info.created as usize;
        }
        assert_eq!(ports.len(), 1);
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn delete_releases_the_port() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(43300, 43400)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        manager.delete_tunnel("abc", "jupyter").await.unwrap();

        assert!(TcpStream::connect(("127.0.0.1", info.port)).await.is_err());
        assert!(!manager.query_tunnel("abc", "jupyter").await.unwrap());
        assert!(matches!(
            manager.delete_tunnel("abc", "jupyter").await,
            Err(ManagerError::NotFound(_))
        ));

        let again = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        assert!(again.created);
    }

    #[tokio::test]
    async fn racing_for_the_last_port() {
        let gateway = MockGateway::echo().await;
        let port = free_port();
        let manager = Arc::new(Manager::new(config(port, port)).unwrap());
        manager.set_credentials(gateway.credentials());

        let a = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_tunnel("s1", AppRequest::new("jupyter")).await })
        };
        let b = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_tunnel("s2", AppRequest::new("jupyter")).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok: Vec<u16> = results.iter().filter_map(|r| r.as_ref().ok()).map(|i| i.port).collect();
        assert_eq!(ok, vec![port]);
        assert!(results.iter().any(|r| matches!(r, Err(ManagerError::Port(_)))));
    }

    #[tokio::test]
    async fn bridges_bytes_through_the_gateway() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(43400, 43500)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc123", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        client.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING\n");

        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "/stream/session/abc123/httpproxy?app=jupyter");
        let authorization = requests[0].header("authorization").unwrap();
        assert!(authorization.starts_with("BackendAI signMethod=HMAC-SHA256, credential=AKTEST:"));
        assert!(requests[0].header("x-backendai-date").is_some());
    }

    #[tokio::test]
    async fn delete_closes_open_connections() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(43500, 43600)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("vnc")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        client.write_all(b"RFB").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();

        manager.delete_tunnel("abc", "vnc").await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), read_until_close(&mut client))
            .await
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn running_tunnels_keep_their_credentials() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(43600, 43700)).unwrap();
        manager.set_credentials(gateway.session_credentials("first"));

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        manager.set_credentials(gateway.session_credentials("second"));
        let other = manager.create_tunnel("abc", AppRequest::new("ttyd")).await.unwrap();

        for port in [info.port, other.port] {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            client.read_exact(&mut buf).await.unwrap();
        }

        let tokens: Vec<String> = gateway
            .requests()
            .iter()
            .map(|r| r.header("x-backendai-sessionid").unwrap().to_string())
            .collect();
        assert_eq!(tokens, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn missing_app_yields_not_found_page() {
        let gateway = MockGateway::rejecting(404).await;
        let manager = Manager::new(config(43700, 43800)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let response = read_until_close(&mut client).await;

        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Server connection failed"));
    }

    #[tokio::test]
    async fn repeated_server_errors_end_in_a_failure_page() {
        let gateway = MockGateway::rejecting(500).await;
        let manager = Manager::new(config(43800, 43900)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let response = tokio::time::timeout(Duration::from_secs(10), read_until_close(&mut client))
            .await
            .unwrap();

        assert_eq!(response.matches("HTTP/1.1 100 Continue\r\n\r\n").count(), 5);
        assert!(response.contains("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(gateway.requests().len(), 6);
    }

    #[tokio::test]
    async fn tcp_apps_retry_without_interim_responses() {
        let gateway = MockGateway::rejecting(500).await;
        let manager = Manager::new(config(43900, 44000)).unwrap();
        manager.set_credentials(gateway.credentials());

        let info = manager.create_tunnel("abc", AppRequest::new("sshd")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let response = read_until_close(&mut client).await;

        assert!(!response.contains("100 Continue"));
        assert!(response.starts_with("HTTP/1.1 500 "));
    }

    #[tokio::test]
    async fn unreachable_gateway_yields_bad_gateway() {
        let endpoint = Url::parse(&format!("http://127.0.0.1:{}", free_port())).unwrap();
        let manager = Manager::new(config(44000, 44100)).unwrap();
        manager.set_credentials(Credentials::new("ak", "sk", endpoint));

        let info = manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let response = read_until_close(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn delete_session_removes_every_app() {
        let gateway = MockGateway::echo().await;
        let manager = Manager::new(config(44100, 44200)).unwrap();
        manager.set_credentials(gateway.credentials());

        manager.create_tunnel("abc", AppRequest::new("jupyter")).await.unwrap();
        manager.create_tunnel("abc", AppRequest::new("ttyd")).await.unwrap();
        manager.create_tunnel("other", AppRequest::new("ttyd")).await.unwrap();

        let tunnels = manager.session_tunnels("abc").await.unwrap();
        assert_eq!(
            tunnels.iter().map(|t| t.app.as_str()).collect::<Vec<_>>(),
            vec!["jupyter", "ttyd"]
        );

        assert_eq!(manager.delete_session("abc").await.unwrap(), 2);
        assert!(!manager.query_session("abc").await.unwrap());
        assert!(manager.query_session("other").await.unwrap());

        manager.shutdown().await;
        assert_eq!(manager.tunnel_count(), 0);
    }
}
