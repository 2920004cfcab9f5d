use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

use super::{CertManager, CertStore};
use crate::common::error::{GateError, Result};

/// Certificate manager backed by an in-process root CA. Server
/// certificates are minted on first use per server name; the root and
/// client identities are exposed so tests can complete real handshakes.
pub struct EphemeralCertManager {
    inner: Arc<CaInner>,
}

struct CaInner {
    ca_cert: Certificate,
    ca_key: KeyPair,
    store: Arc<CertStore>,
}

impl EphemeralCertManager {
    pub fn new() -> Result<Self> {
        let ca_key = KeyPair::generate().map_err(rcgen_err)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, "tlsgate ephemeral CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.self_signed(&ca_key).map_err(rcgen_err)?;

        Ok(EphemeralCertManager {
            inner: Arc::new(CaInner {
                ca_cert,
                ca_key,
                store: CertStore::new(),
            }),
        })
    }

    pub fn ca_pem(&self) -> String {
        self.inner.ca_cert.pem()
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.inner.ca_cert.der().clone()
    }

    /// Mints a server identity chained to the CA, for upstream fixtures.
    pub fn issue_server_identity(
        &self,
        name: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let key = KeyPair::generate().map_err(rcgen_err)?;
        let mut params = CertificateParams::new(vec![name.to_string()]).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params
            .signed_by(&key, &self.inner.ca_cert, &self.inner.ca_key)
            .map_err(rcgen_err)?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        Ok((cert.der().clone(), key_der))
    }

    /// Mints a client identity chained to the CA, for mTLS fixtures.
    pub fn issue_client_identity(
        &self,
        common_name: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let key = KeyPair::generate().map_err(rcgen_err)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        let cert = params
            .signed_by(&key, &self.inner.ca_cert, &self.inner.ca_key)
            .map_err(rcgen_err)?;
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        Ok((cert.der().clone(), key_der))
    }
}

impl CaInner {
    fn issue_server_cert(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        let key = KeyPair::generate().map_err(rcgen_err)?;
        let mut params = CertificateParams::new(vec![name.to_string()]).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(rcgen_err)?;
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
                PrivatePkcs8KeyDer::from(key.serialize_der()),
            ))
            .map_err(|e| GateError::Tls(e.to_string()))?;
        Ok(Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key)))
    }
}

fn rcgen_err(e: rcgen::Error) -> GateError {
    GateError::Tls(e.to_string())
}

impl CertManager for EphemeralCertManager {
    fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(MintingResolver {
            inner: self.inner.clone(),
        })
    }

    fn set_default_server_name(&self, name: String) {
        self.inner.store.set_default_name(name);
    }
}

/// Resolver that mints a certificate the first time a name is asked for.
struct MintingResolver {
    inner: Arc<CaInner>,
}

impl fmt::Debug for MintingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MintingResolver")
    }
}

impl ResolvesServerCert for MintingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = self.inner.store.effective_name(client_hello.server_name());
        if name.is_empty() {
            return None;
        }
        if let Some(key) = self.inner.store.get(&name) {
            return Some(key);
        }
        match self.inner.issue_server_cert(&name) {
            Ok(key) => {
                self.inner.store.insert(&name, key.clone());
                Some(key)
            }
            Err(e) => {
                log::warn!("Failed to issue ephemeral certificate for {}: {}", name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::tls::{init_crypto, subject_dn};

    #[test]
    fn issues_chained_client_identity() {
        init_crypto();
        let manager = EphemeralCertManager::new().unwrap();
        let (cert, _key) = manager.issue_client_identity("alice").unwrap();
        assert_eq!(subject_dn(cert.as_ref()).unwrap(), "CN=alice");
    }

    #[test]
    fn mints_server_cert_on_demand() {
        init_crypto();
        let manager = EphemeralCertManager::new().unwrap();
        let key = manager.inner.issue_server_cert("a.example").unwrap();
        assert_eq!(key.cert.len(), 1);
    }
}
