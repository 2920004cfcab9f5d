use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ResolvesServerCert, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use std::io::BufReader;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use x509_parser::prelude::*;

use crate::common::error::{GateError, Result};
use crate::config::BackendConfig;
use crate::metrics::Events;
use crate::networking::acl::subject_allowed;

pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];
pub const ACME_TLS_ALPN: &str = "acme-tls/1";

pub const ALERT_LEVEL_WARNING: u8 = 1;
pub const ALERT_LEVEL_FATAL: u8 = 2;
pub const ALERT_CLOSE_NOTIFY: u8 = 0;
pub const ALERT_INTERNAL_ERROR: u8 = 80;
pub const ALERT_UNRECOGNIZED_NAME: u8 = 112;

/// Installs the ring provider as the process default. Called once at
/// startup (and by test fixtures); later calls are no-ops.
pub fn init_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Writes a bare TLS alert record to a connection that never got (or will
/// never finish) a handshake, so the peer sees a protocol-level refusal
/// rather than a silent reset.
pub async fn send_alert<W: AsyncWrite + Unpin>(w: &mut W, level: u8, description: u8) {
    let record = [0x15, 0x03, 0x03, 0x00, 0x02, level, description];
    let _ = w.write_all(&record).await;
    let _ = w.flush().await;
}

fn read_pem_bytes(pem_or_path: &str) -> Result<Vec<u8>> {
    if pem_or_path.contains("-----BEGIN") {
        Ok(pem_or_path.as_bytes().to_vec())
    } else {
        Ok(std::fs::read(pem_or_path)?)
    }
}

/// Loads a root store from inline PEM or a file path.
pub fn load_root_store(pem_or_path: &str) -> Result<RootCertStore> {
    let bytes = read_pem_bytes(pem_or_path)?;
    let mut reader = BufReader::new(bytes.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(GateError::Io)?;
    if certs.is_empty() {
        return Err(GateError::Tls("no certificates found in CA pool".to_string()));
    }
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| GateError::Tls(format!("bad CA certificate: {}", e)))?;
    }
    Ok(store)
}

/// Builds the tenant TLS config for one backend: the shared SNI cert
/// resolver, the backend's ALPN list, and (when client auth is on)
/// require-and-verify client certificates filtered by the subject ACL.
pub fn backend_server_config(
    backend: &BackendConfig,
    resolver: Arc<dyn ResolvesServerCert>,
    events: Arc<Events>,
) -> Result<Arc<ServerConfig>> {
    let builder = ServerConfig::builder();
    let mut config = if backend.client_auth {
        let cas = backend
            .client_cas
            .as_ref()
            .ok_or_else(|| GateError::Config("ClientAuth without ClientCAs".to_string()))?;
        let roots = load_root_store(cas)?;
        let inner = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| GateError::Tls(e.to_string()))?;
        let verifier = Arc::new(SubjectAclVerifier {
            inner,
            acl: backend.client_acl.clone(),
            server_name: backend.server_names[0].clone(),
            events,
        });
        builder
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver)
    } else {
        builder.with_no_client_auth().with_cert_resolver(resolver)
    };
    config.alpn_protocols = match &backend.alpn_protos {
        Some(protos) => protos.iter().map(|p| p.as_bytes().to_vec()).collect(),
        None => DEFAULT_ALPN.iter().map(|p| p.as_bytes().to_vec()).collect(),
    };
    Ok(Arc::new(config))
}

/// Config used to answer `acme-tls/1` handshakes: challenge certificates
/// only, and exactly that one protocol on the wire.
pub fn challenge_server_config(resolver: Arc<dyn ResolvesServerCert>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![ACME_TLS_ALPN.as_bytes().to_vec()];
    Arc::new(config)
}

/// Client config for dialing a TLS-mode upstream. `ForwardRootCAs`
/// replaces the public roots when configured.
pub fn upstream_client_config(forward_root_cas: Option<&str>) -> Result<Arc<ClientConfig>> {
    let roots = match forward_root_cas {
        Some(pem_or_path) => load_root_store(pem_or_path)?,
        None => {
            let mut store = RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            store
        }
    };
    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

/// String form of a certificate's subject DN: most-specific RDN first,
/// comma-joined, short attribute names. This is the form the client ACLs
/// are written in.
pub fn subject_dn(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| GateError::Tls(format!("bad peer certificate: {}", e)))?;
    Ok(format_name(cert.subject()))
}

fn format_name(name: &X509Name<'_>) -> String {
    use x509_parser::oid_registry as reg;
    let mut parts = Vec::new();
    for attr in name.iter_attributes() {
        let value = attr.as_str().unwrap_or_default();
        let oid = attr.attr_type();
        let key = if *oid == reg::OID_X509_COMMON_NAME {
            "CN".to_string()
        } else if *oid == reg::OID_X509_ORGANIZATION_NAME {
            "O".to_string()
        } else if *oid == reg::OID_X509_ORGANIZATIONAL_UNIT {
            "OU".to_string()
        } else if *oid == reg::OID_X509_COUNTRY_NAME {
            "C".to_string()
        } else if *oid == reg::OID_X509_LOCALITY_NAME {
            "L".to_string()
        } else if *oid == reg::OID_X509_STATE_OR_PROVINCE_NAME {
            "ST".to_string()
        } else {
            oid.to_id_string()
        };
        parts.push(format!("{}={}", key, value));
    }
    parts.reverse();
    parts.join(",")
}

/// Client-certificate verifier that layers the backend's subject ACL on
/// top of webpki chain validation. This runs inside the handshake, before
/// the server Finished message, so a denied peer never completes the
/// session.
#[derive(Debug)]
pub struct SubjectAclVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    acl: Option<Vec<String>>,
    server_name: String,
    events: Arc<Events>,
}

impl ClientCertVerifier for SubjectAclVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.inner.verify_client_cert(end_entity, intermediates, now)?;
        let subject = subject_dn(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        if !subject_allowed(self.acl.as_deref(), &subject) {
            self.events
                .record(format!("deny [{}] to {}", subject, self.server_name));
            return Err(rustls::Error::General("access denied".to_string()));
        }
        if !subject.is_empty() {
            self.events
                .record(format!("allow [{}] to {}", subject, self.server_name));
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}
