use log::debug;
use rustls::pki_types::ServerName;
use rustls::server::ResolvesServerCert;
use rustls::{ClientConfig, ServerConfig};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::common::error::{GateError, Result};
use crate::config::{BackendConfig, Mode};
use crate::httpd::HttpServerHandle;
use crate::metrics::Events;
use crate::networking::acl::IpAcl;
use crate::networking::tls::{backend_server_config, upstream_client_config};
use crate::traffic::limiter::BackendLimiter;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One tenant of the proxy: the server names it answers for and everything
/// needed to admit, terminate, and forward its sessions. Immutable once
/// published into the registry; reconfiguration builds replacements.
pub struct Backend {
    pub server_names: Vec<String>,
    pub mode: Mode,
    pub sso: bool,
    pub client_auth: bool,
    pub client_acl: Option<Vec<String>>,
    pub tls_config: Option<Arc<ServerConfig>>,
    pub ip_acl: IpAcl,
    pub addresses: Vec<String>,
    next_addr: AtomicUsize,
    pub upstream_tls: Option<Arc<ClientConfig>>,
    pub limiter: BackendLimiter,
    /// Upstream client for the reverse-proxied HTTP modes.
    pub http_client: Option<reqwest::Client>,
    /// Handle to the in-process HTTP server, set right after construction
    /// for HTTP-family modes.
    pub http: OnceLock<HttpServerHandle>,
}

impl Backend {
    pub fn new(
        cfg: &BackendConfig,
        resolver: Arc<dyn ResolvesServerCert>,
        events: Arc<Events>,
    ) -> Result<Self> {
        let tls_config = match cfg.mode {
            Mode::TlsPassthrough => None,
            _ => Some(backend_server_config(cfg, resolver, events)?),
        };
        let upstream_tls = match cfg.mode {
            Mode::Tls => Some(upstream_client_config(cfg.forward_root_cas.as_deref())?),
            _ => None,
        };
        let http_client = match cfg.mode {
            Mode::Http | Mode::Https => Some(build_http_client(cfg)?),
            _ => None,
        };

        Ok(Backend {
            server_names: cfg.server_names.iter().map(|n| n.to_lowercase()).collect(),
            mode: cfg.mode,
            sso: cfg.sso,
            client_auth: cfg.client_auth,
            client_acl: cfg.client_acl.clone(),
            tls_config,
            ip_acl: IpAcl::new(&cfg.allow_ips, &cfg.deny_ips),
            addresses: cfg.addresses.clone(),
            next_addr: AtomicUsize::new(0),
            upstream_tls,
            limiter: BackendLimiter::new(cfg.rate_limit.as_ref()),
            http_client,
            http: OnceLock::new(),
        })
    }

    pub fn check_ip(&self, ip: IpAddr) -> std::result::Result<(), &'static str> {
        self.ip_acl.check(ip)
    }

    /// Round-robin over the configured upstream addresses.
    pub fn next_address(&self) -> String {
        let i = self.next_addr.fetch_add(1, Ordering::Relaxed);
        self.addresses[i % self.addresses.len()].clone()
    }

    /// Dials the upstream, trying each address in rotation until one
    /// answers.
    pub async fn dial(&self) -> io::Result<(TcpStream, String)> {
        let start = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let mut last_err = io::Error::new(io::ErrorKind::NotConnected, "no addresses");
        for i in 0..self.addresses.len() {
            let addr = &self.addresses[(start + i) % self.addresses.len()];
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set nodelay on upstream stream: {}", e);
                    }
                    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
                    if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                        debug!("Failed to enable keepalive for {}: {}", addr, e);
                    }
                    return Ok((stream, addr.clone()));
                }
                Ok(Err(e)) => {
                    debug!("Dial {} failed: {}", addr, e);
                    last_err = e;
                }
                Err(_) => {
                    debug!("Dial {} timed out", addr);
                    last_err = io::Error::new(io::ErrorKind::TimedOut, "dial timeout");
                }
            }
        }
        Err(last_err)
    }

    /// Dials and wraps the upstream in TLS, forwarding the externally
    /// negotiated ALPN so the upstream can match it.
    pub async fn dial_tls(
        &self,
        alpn: Option<&str>,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let (stream, addr) = self.dial().await?;
        let base = self
            .upstream_tls
            .as_ref()
            .ok_or_else(|| io::Error::other("no upstream TLS config"))?;
        let mut config = (**base).clone();
        if let Some(proto) = alpn {
            config.alpn_protocols = vec![proto.as_bytes().to_vec()];
        }
        let connector = TlsConnector::from(Arc::new(config));
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr.as_str());
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        connector.connect(server_name, stream).await
    }
}

fn build_http_client(cfg: &BackendConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(DIAL_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none());
    if cfg.mode == Mode::Https {
        if let Some(roots) = &cfg.forward_root_cas {
            let pem = if roots.contains("-----BEGIN") {
                roots.as_bytes().to_vec()
            } else {
                std::fs::read(roots)?
            };
            let mut reader = std::io::BufReader::new(pem.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(GateError::Io)?;
                let cert = reqwest::Certificate::from_der(cert.as_ref())
                    .map_err(|e| GateError::Tls(e.to_string()))?;
                builder = builder.add_root_certificate(cert);
            }
        }
    }
    builder.build().map_err(|e| GateError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::tls::init_crypto;
    use std::sync::Arc;

    fn tcp_backend(addresses: Vec<String>) -> Backend {
        init_crypto();
        let cfg = BackendConfig {
            server_names: vec!["A.example".to_string()],
            mode: Mode::Tcp,
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
        };
        let store = crate::certs::CertStore::new();
        let resolver = crate::certs::StoreResolver::new(store);
        Backend::new(&cfg, resolver, Arc::new(Events::default())).unwrap()
    }

    #[test]
    fn server_names_are_lowercased() {
        let backend = tcp_backend(vec!["127.0.0.1:1".to_string()]);
        assert_eq!(backend.server_names, vec!["a.example".to_string()]);
    }

    #[test]
    fn addresses_rotate() {
        let backend = tcp_backend(vec!["h1:1".to_string(), "h2:2".to_string()]);
        let a = backend.next_address();
        let b = backend.next_address();
        let c = backend.next_address();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn dial_rotates_to_a_live_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();
        // One dead address, one live one; the dial loop must land on the
        // live one regardless of where the rotation starts.
        let backend = tcp_backend(vec!["127.0.0.1:1".to_string(), live.clone()]);
        let (_stream, addr) = backend.dial().await.unwrap();
        assert_eq!(addr, live);
    }
}
