use arc_swap::ArcSwap;
use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

pub mod acme;
pub mod ephemeral;

/// Source of server certificates for the SNI-driven selector. The proxy
/// talks to the manager only through this surface; the ACME machinery and
/// the in-process test CA are interchangeable behind it.
pub trait CertManager: Send + Sync {
    /// Certificate selector for regular handshakes.
    fn resolver(&self) -> Arc<dyn ResolvesServerCert>;

    /// Selector consulted for `acme-tls/1` challenge handshakes.
    fn challenge_resolver(&self) -> Arc<dyn ResolvesServerCert> {
        self.resolver()
    }

    /// ACME HTTP-01 answer for a challenge token, if one is pending.
    fn http01_key_auth(&self, _token: &str) -> Option<String> {
        None
    }

    /// Names the proxy currently answers for; managers that order
    /// certificates use this as their work list.
    fn set_domains(&self, _domains: Vec<String>) {}

    /// Name substituted when a ClientHello carries no SNI.
    fn set_default_server_name(&self, name: String);
}

/// SNI → certificate map shared between a manager (writer) and its
/// resolver (reader), with the default-name substitution applied on
/// lookup.
pub struct CertStore {
    certs: DashMap<String, Arc<CertifiedKey>>,
    // Read on every handshake, written only on reconfiguration.
    default_name: ArcSwap<String>,
}

impl CertStore {
    pub fn new() -> Arc<Self> {
        Arc::new(CertStore {
            certs: DashMap::new(),
            default_name: ArcSwap::from_pointee(String::new()),
        })
    }

    pub fn set_default_name(&self, name: String) {
        self.default_name.store(Arc::new(name.to_lowercase()));
    }

    /// The name a ClientHello resolves to: its own SNI, or the configured
    /// default when the hello carries none.
    pub fn effective_name(&self, sni: Option<&str>) -> String {
        match sni {
            Some(name) if !name.is_empty() => name.to_lowercase(),
            _ => self.default_name.load().as_str().to_string(),
        }
    }

    pub fn insert(&self, name: &str, key: Arc<CertifiedKey>) {
        self.certs.insert(name.to_lowercase(), key);
    }

    pub fn get(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(&name.to_lowercase()).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.certs.contains_key(&name.to_lowercase())
    }
}

/// Plain lookup resolver over a [`CertStore`].
pub struct StoreResolver {
    store: Arc<CertStore>,
}

impl StoreResolver {
    pub fn new(store: Arc<CertStore>) -> Arc<Self> {
        Arc::new(StoreResolver { store })
    }
}

impl fmt::Debug for StoreResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreResolver")
    }
}

impl ResolvesServerCert for StoreResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = self.store.effective_name(client_hello.server_name());
        if name.is_empty() {
            return None;
        }
        self.store.get(&name)
    }
}
