use log::{debug, error, info};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::certs::CertManager;
use crate::common::error::{GateError, Result};
use crate::config::Config;
use crate::core::backend::Backend;
use crate::core::dispatch::handle_connection;
use crate::httpd::{run_http_listener, spawn_backend_server};
use crate::metrics::Events;
use crate::networking::conn::ConnState;
use crate::networking::tls::challenge_server_config;
use crate::oidc::OidcProvider;

type ConnKey = (SocketAddr, SocketAddr);

/// The proxy singleton: listeners, backend registry, live-connection
/// table, events, and the root cancellation context. One lock guards the
/// mutable state; it is never held across I/O.
pub struct Proxy {
    cert_manager: Arc<dyn CertManager>,
    cancel: CancellationToken,
    events: Arc<Events>,
    state: Mutex<ProxyState>,
    oidc: Mutex<Option<Arc<OidcProvider>>>,
    bound_tls: OnceLock<SocketAddr>,
    challenge_config: OnceLock<Arc<ServerConfig>>,
}

struct ProxyState {
    config: Config,
    applied: bool,
    registry: HashMap<String, Arc<Backend>>,
    default_server_name: String,
    conns: HashMap<ConnKey, Arc<ConnState>>,
}

impl Proxy {
    pub fn new(config: Config, cert_manager: Arc<dyn CertManager>) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| GateError::Config(e.to_string()))?;
        Ok(Arc::new(Proxy {
            cert_manager,
            cancel: CancellationToken::new(),
            events: Arc::new(Events::default()),
            state: Mutex::new(ProxyState {
                config,
                applied: false,
                registry: HashMap::new(),
                default_server_name: String::new(),
                conns: HashMap::new(),
            }),
            oidc: Mutex::new(None),
            bound_tls: OnceLock::new(),
            challenge_config: OnceLock::new(),
        }))
    }

    /// Binds the listeners, applies the initial configuration, and spawns
    /// the accept loops. Only listener-creation errors surface here.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.state.lock().unwrap().config.clone();

        let listener = TcpListener::bind(&config.tls_addr).await?;
        let bound = listener.local_addr()?;
        let _ = self.bound_tls.set(bound);
        info!("Listening for TLS connections on {}", bound);

        let http_listener = match &config.http_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("Listening for HTTP on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        self.apply(config).await?;

        let proxy = self.clone();
        tokio::spawn(async move {
            proxy.accept_loop(listener).await;
        });
        if let Some(listener) = http_listener {
            tokio::spawn(run_http_listener(self.clone(), listener, self.cancel.clone()));
        }
        Ok(())
    }

    /// Cancels the accept loops, in-flight handshakes, and pending
    /// rate-limit waits. Bridges drain as their sockets close.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Swaps in a new configuration. An identical configuration is a
    /// no-op; a rejected one leaves the previous configuration in effect.
    pub async fn reconfigure(self: &Arc<Self>, new_config: Config) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.applied {
                let old = serde_yaml::to_string(&state.config)?;
                let new = serde_yaml::to_string(&new_config)?;
                if old == new {
                    debug!("Configuration unchanged");
                    return Ok(());
                }
                if new_config.tls_addr != state.config.tls_addr
                    || new_config.http_addr != state.config.http_addr
                    || new_config.cache_dir != state.config.cache_dir
                {
                    return Err(GateError::Config(
                        "TLSAddr, HTTPAddr and CacheDir cannot change at runtime".to_string(),
                    ));
                }
            }
        }
        new_config
            .validate()
            .map_err(|e| GateError::Config(e.to_string()))?;
        self.apply(new_config).await
    }

    async fn apply(self: &Arc<Self>, config: Config) -> Result<()> {
        let resolver = self.cert_manager.resolver();

        // Build everything fallible first; only then spawn HTTP servers,
        // so a rejected backend leaves nothing running.
        let mut built: Vec<Arc<Backend>> = Vec::new();
        for backend_cfg in &config.backends {
            built.push(Arc::new(Backend::new(
                backend_cfg,
                resolver.clone(),
                self.events.clone(),
            )?));
        }
        let mut registry: HashMap<String, Arc<Backend>> = HashMap::new();
        for backend in built {
            if backend.mode.is_http_family() {
                let handle = spawn_backend_server(self.clone(), backend.clone());
                let _ = backend.http.set(handle);
            }
            for name in &backend.server_names {
                registry.insert(name.clone(), backend.clone());
            }
        }

        let rebuild_oidc = {
            let state = self.state.lock().unwrap();
            !state.applied || state.config.oidc != config.oidc
        };
        if rebuild_oidc {
            *self.oidc.lock().unwrap() = config
                .oidc
                .clone()
                .map(|c| Arc::new(OidcProvider::new(c, self.events.clone())));
        }

        self.cert_manager
            .set_default_server_name(config.default_server_name.clone());
        self.cert_manager.set_domains(
            config
                .backends
                .iter()
                .flat_map(|b| b.server_names.iter().cloned())
                .collect(),
        );

        let backend_count = config.backends.len();
        let displaced: Vec<Arc<Backend>> = {
            let mut state = self.state.lock().unwrap();
            let old: Vec<Arc<Backend>> = state.registry.values().cloned().collect();
            state.registry = registry;
            state.default_server_name = config.default_server_name.to_lowercase();
            state.config = config;
            state.applied = true;
            old
        };

        // A backend appears once per server name; shut each HTTP server
        // down once, with its grace period.
        let mut unique: Vec<Arc<Backend>> = Vec::new();
        for backend in displaced {
            if !unique.iter().any(|b| Arc::ptr_eq(b, &backend)) {
                unique.push(backend);
            }
        }
        for backend in unique {
            if let Some(server) = backend.http.get() {
                server.shutdown().await;
            }
        }

        info!("Configuration applied: {} backends", backend_count);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set nodelay for {}: {}", peer, e);
            }
            let proxy = self.clone();
            tokio::spawn(handle_connection(proxy, stream, peer));
        }
    }

    pub fn backend(&self, server_name: &str) -> Option<Arc<Backend>> {
        self.state
            .lock()
            .unwrap()
            .registry
            .get(&server_name.to_lowercase())
            .cloned()
    }

    pub fn default_server_name(&self) -> String {
        self.state.lock().unwrap().default_server_name.clone()
    }

    pub fn max_open(&self) -> usize {
        self.state.lock().unwrap().config.max_open
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    pub fn register(&self, key: ConnKey, state: Arc<ConnState>) {
        self.state.lock().unwrap().conns.insert(key, state);
    }

    pub fn unregister(&self, key: &ConnKey) {
        self.state.lock().unwrap().conns.remove(key);
    }

    pub fn events(&self) -> &Arc<Events> {
        &self.events
    }

    pub fn oidc(&self) -> Option<Arc<OidcProvider>> {
        self.oidc.lock().unwrap().clone()
    }

    pub fn cert_manager(&self) -> Arc<dyn CertManager> {
        self.cert_manager.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The actual TLS listen address; useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_tls.get().copied()
    }

    pub fn challenge_tls_config(&self) -> Arc<ServerConfig> {
        self.challenge_config
            .get_or_init(|| challenge_server_config(self.cert_manager.challenge_resolver()))
            .clone()
    }

    pub fn config_yaml(&self) -> String {
        let state = self.state.lock().unwrap();
        serde_yaml::to_string(&state.config).unwrap_or_default()
    }

    /// Plain-text status page for the admin console.
    pub fn console_page(&self) -> String {
        let mut page = String::new();
        let _ = writeln!(page, "tlsgate\n");
        let _ = writeln!(page, "Events:");
        for (tag, count) in self.events.snapshot() {
            let _ = writeln!(page, "  {:8} {}", count, tag);
        }
        let _ = writeln!(page, "\nConnections:");
        {
            let state = self.state.lock().unwrap();
            for conn in state.conns.values() {
                let _ = writeln!(page, "  {}", conn.summary());
            }
        }
        let _ = writeln!(page, "\nMetrics:\n");
        page.push_str(&crate::metrics::render());
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::ephemeral::EphemeralCertManager;
    use crate::config::{BackendConfig, Mode};
    use crate::networking::tls::init_crypto;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn backend_cfg(names: &[&str], mode: Mode, addresses: Vec<String>) -> BackendConfig {
        BackendConfig {
            server_names: names.iter().map(|n| n.to_string()).collect(),
            mode,
            addresses,
            alpn_protos: None,
            client_auth: false,
            client_cas: None,
            client_acl: None,
            forward_root_cas: None,
            allow_ips: vec![],
            deny_ips: vec![],
            rate_limit: None,
            sso: false,
        }
    }

    fn base_config(backends: Vec<BackendConfig>) -> Config {
        Config {
            tls_addr: "127.0.0.1:0".to_string(),
            http_addr: None,
            cache_dir: String::new(),
            email: String::new(),
            default_server_name: String::new(),
            max_open: 100,
            acme_directory: None,
            oidc: None,
            backends,
        }
    }

    async fn start_proxy(config: Config) -> (Arc<Proxy>, Arc<EphemeralCertManager>) {
        init_crypto();
        let manager = Arc::new(EphemeralCertManager::new().unwrap());
        let proxy = Proxy::new(config, manager.clone()).unwrap();
        proxy.start().await.unwrap();
        (proxy, manager)
    }

    fn client_config(manager: &EphemeralCertManager, alpn: &[&str]) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(manager.ca_der()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        config
    }

    /// Upstream that answers "PING\n" with "PONG\n" and then waits for EOF.
    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 5];
                    if sock.read_exact(&mut buf).await.is_ok() && &buf == b"PING\n" {
                        let _ = sock.write_all(b"PONG\n").await;
                    }
                    let mut rest = [0u8; 16];
                    let _ = sock.read(&mut rest).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_mode_bridges_and_accounts_bytes() {
        let upstream = spawn_echo_upstream().await;
        let config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        let (proxy, manager) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(client_config(&manager, &[])));
        let name = ServerName::try_from("a.example".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        tls.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG\n");

        // Grab the live record before closing so the totals survive the
        // table removal.
        let conn_state = {
            let state = proxy.state.lock().unwrap();
            state.conns.values().next().unwrap().clone()
        };

        tls.shutdown().await.unwrap();
        // Wait for the proxy's own close so the bridge finishes cleanly.
        let mut tail = [0u8; 1];
        let n = tls.read(&mut tail).await.unwrap_or(0);
        assert_eq!(n, 0);
        drop(tls);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(proxy.open_connections(), 0);
        let (recv, sent) = conn_state.transfer();
        assert_eq!(recv, 5);
        assert_eq!(sent, 5);
        assert_eq!(proxy.events().count("unexpected SNI"), 0);
        assert_eq!(proxy.events().count("tls handshake failed"), 0);
        assert_eq!(proxy.events().count("invalid ClientHello"), 0);
        proxy.stop();
    }

    #[tokio::test]
    async fn unknown_sni_gets_unrecognized_name() {
        let upstream = spawn_echo_upstream().await;
        let config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        let (proxy, manager) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(client_config(&manager, &[])));
        let name = ServerName::try_from("b.example".to_string()).unwrap();
        let result = connector.connect(name, tcp).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(proxy.events().count("unexpected SNI"), 1);
        proxy.stop();
    }

    #[tokio::test]
    async fn empty_sni_routes_to_default_backend() {
        let upstream = spawn_echo_upstream().await;
        let mut config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        config.default_server_name = "a.example".to_string();
        let (proxy, _manager) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        // rustls omits the SNI extension for IP-address server names; the
        // certificate check is disabled because the minted certificate
        // only names a.example.
        let mut cc = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        cc.dangerous()
            .set_certificate_verifier(Arc::new(NoVerify));
        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(cc));
        let name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        tls.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG\n");

        assert_eq!(proxy.events().count("no SNI"), 1);
        proxy.stop();
    }

    #[tokio::test]
    async fn admission_cap_answers_close_notify() {
        let upstream = spawn_echo_upstream().await;
        let mut config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        config.max_open = 2;
        let (proxy, _manager) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        // Two connections park in the ClientHello read and stay registered.
        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(proxy.open_connections(), 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        let mut alert = [0u8; 7];
        c3.read_exact(&mut alert).await.unwrap();
        assert_eq!(alert, [0x15, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00]);
        assert_eq!(proxy.events().count("too many open connections"), 1);
        proxy.stop();
    }

    #[tokio::test]
    async fn passthrough_delivers_original_handshake() {
        init_crypto();
        // The upstream terminates TLS itself with its own CA; the proxy
        // must forward the client's bytes untouched for the end-to-end
        // handshake to succeed.
        let upstream_ca = EphemeralCertManager::new().unwrap();
        let (cert, key) = upstream_ca.issue_server_identity("p.example").unwrap();
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(sock).await {
                        let mut buf = [0u8; 5];
                        if tls.read_exact(&mut buf).await.is_ok() {
                            let _ = tls.write_all(b"PONG\n").await;
                        }
                        let _ = tls.shutdown().await;
                    }
                });
            }
        });

        let config = base_config(vec![backend_cfg(
            &["p.example"],
            Mode::TlsPassthrough,
            vec![upstream_addr.to_string()],
        )]);
        let (proxy, _proxy_ca) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(upstream_ca.ca_der()).unwrap();
        let cc = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(cc));
        let name = ServerName::try_from("p.example".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        tls.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG\n");
        proxy.stop();
    }

    /// Upstream speaking just enough HTTP/1.1 for the reverse proxy.
    async fn spawn_http_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut total = 0;
                    loop {
                        let n = sock.read(&mut buf[total..]).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let body = b"hello";
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.write_all(body).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn client_subject_acl_gates_http_mode() {
        let upstream = spawn_http_upstream().await;
        init_crypto();
        let manager = Arc::new(EphemeralCertManager::new().unwrap());

        let mut backend = backend_cfg(&["c.example"], Mode::Http, vec![upstream.to_string()]);
        backend.client_auth = true;
        backend.client_cas = Some(manager.ca_pem());
        backend.client_acl = Some(vec!["CN=alice".to_string()]);
        backend.alpn_protos = Some(vec!["http/1.1".to_string()]);
        let config = base_config(vec![backend]);

        let proxy = Proxy::new(config, manager.clone()).unwrap();
        proxy.start().await.unwrap();
        let addr = proxy.local_addr().unwrap();

        // alice is on the ACL and reaches the upstream through the
        // in-process HTTP server.
        let (cert, key) = manager.issue_client_identity("alice").unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(manager.ca_der()).unwrap();
        let mut cc = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![cert], key)
            .unwrap();
        cc.alpn_protocols = vec![b"http/1.1".to_vec()];
        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(cc));
        let name = ServerName::try_from("c.example".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();
        tls.write_all(b"GET / HTTP/1.1\r\nHost: c.example\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = tls.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.contains("200 OK"), "got: {}", response);
        assert!(response.contains("hello"), "got: {}", response);
        assert_eq!(proxy.events().count("allow [CN=alice] to c.example"), 1);

        // bob verifies against the same CA but is not on the ACL.
        let (cert, key) = manager.issue_client_identity("bob").unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(manager.ca_der()).unwrap();
        let mut cc = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![cert], key)
            .unwrap();
        cc.alpn_protocols = vec![b"http/1.1".to_vec()];
        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector = TlsConnector::from(Arc::new(cc));
        let name = ServerName::try_from("c.example".to_string()).unwrap();
        let denied = async {
            let mut tls = connector.connect(name, tcp).await?;
            tls.write_all(b"GET / HTTP/1.1\r\nHost: c.example\r\n\r\n").await?;
            let mut buf = [0u8; 1];
            match tls.read(&mut buf).await? {
                0 => Err(std::io::Error::other("clean close")),
                _ => Ok(()),
            }
        }
        .await;
        assert!(denied.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(proxy.events().count("deny [CN=bob] to c.example"), 1);
        assert_eq!(proxy.events().count("access denied"), 1);
        proxy.stop();
    }

    #[tokio::test]
    async fn acme_alpn_challenge_handshake_closes_after() {
        let upstream = spawn_echo_upstream().await;
        let config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        let (proxy, manager) = start_proxy(config).await;
        let addr = proxy.local_addr().unwrap();

        let tcp = TcpStream::connect(addr).await.unwrap();
        let connector =
            TlsConnector::from(Arc::new(client_config(&manager, &["acme-tls/1"])));
        let name = ServerName::try_from("a.example".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();
        assert_eq!(
            tls.get_ref().1.alpn_protocol(),
            Some(b"acme-tls/1".as_ref())
        );
        let mut buf = [0u8; 1];
        assert!(matches!(tls.read(&mut buf).await, Ok(0) | Err(_)));
        proxy.stop();
    }

    #[tokio::test]
    async fn reconfigure_noop_and_swap() {
        let upstream = spawn_echo_upstream().await;
        let config = base_config(vec![backend_cfg(
            &["a.example"],
            Mode::Tcp,
            vec![upstream.to_string()],
        )]);
        let (proxy, _manager) = start_proxy(config.clone()).await;

        let before = proxy.backend("a.example").unwrap();
        proxy.reconfigure(config.clone()).await.unwrap();
        let after = proxy.backend("a.example").unwrap();
        assert!(Arc::ptr_eq(&before, &after));

        let mut changed = config.clone();
        changed.backends[0].addresses = vec!["127.0.0.1:9999".to_string()];
        proxy.reconfigure(changed).await.unwrap();
        let swapped = proxy.backend("a.example").unwrap();
        assert!(!Arc::ptr_eq(&before, &swapped));

        let mut rebind = config.clone();
        rebind.tls_addr = "127.0.0.1:1".to_string();
        assert!(proxy.reconfigure(rebind).await.is_err());
        proxy.stop();
    }

    #[derive(Debug)]
    struct NoVerify;

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            vec![
                rustls::SignatureScheme::RSA_PKCS1_SHA256,
                rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
                rustls::SignatureScheme::RSA_PKCS1_SHA384,
                rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
                rustls::SignatureScheme::RSA_PKCS1_SHA512,
                rustls::SignatureScheme::RSA_PSS_SHA256,
                rustls::SignatureScheme::RSA_PSS_SHA384,
                rustls::SignatureScheme::RSA_PSS_SHA512,
                rustls::SignatureScheme::ED25519,
            ]
        }
    }
}
