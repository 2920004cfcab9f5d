use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use log::{debug, info, warn};
use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::*;

use super::{CertManager, CertStore, StoreResolver};
use crate::common::error::{GateError, Result};

// Reorder this long before the certificate lapses.
const RENEW_MARGIN: Duration = Duration::from_secs(30 * 24 * 3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// ACME-backed certificate manager. Certificates and the account key live
/// under the cache directory; a background task orders and renews them for
/// whatever domains the proxy currently serves. TLS-ALPN-01 is preferred,
/// HTTP-01 answered through `http01_key_auth` when that is all the
/// directory offers.
pub struct AcmeManager {
    inner: Arc<AcmeInner>,
}

struct AcmeInner {
    email: String,
    directory_url: String,
    cache_dir: PathBuf,
    store: Arc<CertStore>,
    challenges: DashMap<String, Arc<CertifiedKey>>,
    http01: DashMap<String, String>,
    domains: std::sync::Mutex<Vec<String>>,
    account: Mutex<Option<Account>>,
    kick: Notify,
}

impl AcmeManager {
    pub fn new(email: &str, directory_url: Option<&str>, cache_dir: &str) -> Result<Self> {
        if cache_dir.is_empty() {
            return Err(GateError::Config(
                "CacheDir is required for ACME certificates".to_string(),
            ));
        }
        let cache_dir = PathBuf::from(cache_dir);
        std::fs::create_dir_all(&cache_dir)?;
        Ok(AcmeManager {
            inner: Arc::new(AcmeInner {
                email: email.to_string(),
                directory_url: directory_url
                    .map(str::to_string)
                    .unwrap_or_else(|| LetsEncrypt::Production.url().to_string()),
                cache_dir,
                store: CertStore::new(),
                challenges: DashMap::new(),
                http01: DashMap::new(),
                domains: std::sync::Mutex::new(Vec::new()),
                account: Mutex::new(None),
                kick: Notify::new(),
            }),
        })
    }

    /// Starts the order/renewal task. It wakes on a timer, on every
    /// `set_domains`, and dies with the proxy's root token.
    pub fn spawn_renewal(&self, cancel: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = sweep(&inner).await {
                    warn!("ACME sweep failed: {}", e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = inner.kick.notified() => {}
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
            }
        });
    }
}

impl CertManager for AcmeManager {
    fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        StoreResolver::new(self.inner.store.clone())
    }

    fn challenge_resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(ChallengeResolver {
            inner: self.inner.clone(),
        })
    }

    fn http01_key_auth(&self, token: &str) -> Option<String> {
        self.inner.http01.get(token).map(|e| e.value().clone())
    }

    fn set_domains(&self, domains: Vec<String>) {
        let mut list: Vec<String> = domains
            .into_iter()
            .map(|d| d.to_lowercase())
            .filter(|d| d.parse::<std::net::IpAddr>().is_err())
            .collect();
        list.sort();
        list.dedup();
        *self.inner.domains.lock().unwrap() = list;
        self.inner.kick.notify_one();
    }

    fn set_default_server_name(&self, name: String) {
        self.inner.store.set_default_name(name);
    }
}

async fn sweep(inner: &Arc<AcmeInner>) -> Result<()> {
    let domains = inner.domains.lock().unwrap().clone();
    for domain in domains {
        if inner.store.contains(&domain) && !needs_renewal(inner, &domain) {
            continue;
        }
        if load_cached(inner, &domain).is_ok() && !needs_renewal(inner, &domain) {
            continue;
        }
        if let Err(e) = order_certificate(inner, &domain).await {
            warn!("ACME order for {} failed: {}", domain, e);
        }
    }
    Ok(())
}

fn cert_path(inner: &AcmeInner, domain: &str) -> PathBuf {
    inner.cache_dir.join(format!("{}.crt", domain))
}

fn key_path(inner: &AcmeInner, domain: &str) -> PathBuf {
    inner.cache_dir.join(format!("{}.key", domain))
}

fn load_cached(inner: &AcmeInner, domain: &str) -> Result<()> {
    let chain_pem = std::fs::read(cert_path(inner, domain))?;
    let key_pem = std::fs::read(key_path(inner, domain))?;
    let key = certified_key(&chain_pem, &key_pem)?;
    inner.store.insert(domain, key);
    debug!("Loaded cached certificate for {}", domain);
    Ok(())
}

fn certified_key(chain_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let mut reader = BufReader::new(chain_pem);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(GateError::Io)?;
    if chain.is_empty() {
        return Err(GateError::Acme("empty certificate chain".to_string()));
    }
    let mut key_reader = BufReader::new(key_pem);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(GateError::Io)?
        .ok_or_else(|| GateError::Acme("no private key in cache".to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| GateError::Tls(e.to_string()))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn needs_renewal(inner: &AcmeInner, domain: &str) -> bool {
    let Some(key) = inner.store.get(domain) else {
        return true;
    };
    let Some(leaf) = key.cert.first() else {
        return true;
    };
    match X509Certificate::from_der(leaf.as_ref()) {
        Ok((_, cert)) => {
            let not_after = cert.validity().not_after.timestamp();
            let deadline = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
                + RENEW_MARGIN.as_secs() as i64;
            not_after < deadline
        }
        Err(_) => true,
    }
}

async fn account(inner: &Arc<AcmeInner>) -> Result<Account> {
    let mut slot = inner.account.lock().await;
    if let Some(account) = slot.as_ref() {
        return Ok(account.clone());
    }
    let creds_path = inner.cache_dir.join("account.json");
    let account = if creds_path.exists() {
        let creds: AccountCredentials =
            serde_json::from_slice(&std::fs::read(&creds_path)?).map_err(acme_err)?;
        Account::from_credentials(creds).await.map_err(acme_err)?
    } else {
        let contact: Vec<String> = if inner.email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{}", inner.email)]
        };
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, creds) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &inner.directory_url,
            None,
        )
        .await
        .map_err(acme_err)?;
        std::fs::write(&creds_path, serde_json::to_vec(&creds).map_err(acme_err)?)?;
        info!("Created ACME account at {}", inner.directory_url);
        account
    };
    *slot = Some(account.clone());
    Ok(account)
}

async fn order_certificate(inner: &Arc<AcmeInner>, domain: &str) -> Result<()> {
    let account = account(inner).await?;
    info!("Ordering certificate for {}", domain);

    let identifiers = [Identifier::Dns(domain.to_string())];
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .map_err(acme_err)?;

    let authorizations = order.authorizations().await.map_err(acme_err)?;
    let mut pending_token = None;
    for authz in &authorizations {
        match authz.status {
            AuthorizationStatus::Pending => {}
            AuthorizationStatus::Valid => continue,
            status => {
                return Err(GateError::Acme(format!(
                    "authorization for {} is {:?}",
                    domain, status
                )));
            }
        }
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::TlsAlpn01)
            .or_else(|| authz.challenges.iter().find(|c| c.r#type == ChallengeType::Http01))
            .ok_or_else(|| GateError::Acme(format!("no usable challenge for {}", domain)))?;
        let key_auth = order.key_authorization(challenge);
        match challenge.r#type {
            ChallengeType::TlsAlpn01 => {
                let cert = challenge_cert(domain, key_auth.digest().as_ref())?;
                inner.challenges.insert(domain.to_string(), cert);
            }
            ChallengeType::Http01 => {
                pending_token = Some(challenge.token.clone());
                inner
                    .http01
                    .insert(challenge.token.clone(), key_auth.as_str().to_string());
            }
            _ => {}
        }
        order.set_challenge_ready(&challenge.url).await.map_err(acme_err)?;
    }

    let result = finish_order(inner, &mut order, domain).await;

    inner.challenges.remove(domain);
    if let Some(token) = pending_token {
        inner.http01.remove(&token);
    }
    result
}

async fn finish_order(
    inner: &Arc<AcmeInner>,
    order: &mut instant_acme::Order,
    domain: &str,
) -> Result<()> {
    let mut delay = Duration::from_millis(500);
    for attempt in 0.. {
        tokio::time::sleep(delay).await;
        let state = order.refresh().await.map_err(acme_err)?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => break,
            OrderStatus::Invalid => {
                return Err(GateError::Acme(format!("order for {} became invalid", domain)));
            }
            _ if attempt >= 10 => {
                return Err(GateError::Acme(format!("order for {} never became ready", domain)));
            }
            _ => delay = (delay * 2).min(Duration::from_secs(10)),
        }
    }

    let key_pair = KeyPair::generate().map_err(|e| GateError::Acme(e.to_string()))?;
    let params =
        CertificateParams::new(vec![domain.to_string()]).map_err(|e| GateError::Acme(e.to_string()))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| GateError::Acme(e.to_string()))?;
    order.finalize(csr.der().as_ref()).await.map_err(acme_err)?;

    let chain_pem = loop {
        match order.certificate().await.map_err(acme_err)? {
            Some(pem) => break pem,
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    };

    std::fs::write(cert_path(inner, domain), chain_pem.as_bytes())?;
    std::fs::write(key_path(inner, domain), key_pair.serialize_pem().as_bytes())?;
    let key = certified_key(chain_pem.as_bytes(), key_pair.serialize_pem().as_bytes())?;
    inner.store.insert(domain, key);
    info!("Obtained certificate for {}", domain);
    Ok(())
}

/// Self-signed certificate carrying the acmeIdentifier extension, served
/// only on `acme-tls/1` handshakes for this domain.
fn challenge_cert(domain: &str, key_auth_digest: &[u8]) -> Result<Arc<CertifiedKey>> {
    let key = KeyPair::generate().map_err(|e| GateError::Acme(e.to_string()))?;
    let mut params =
        CertificateParams::new(vec![domain.to_string()]).map_err(|e| GateError::Acme(e.to_string()))?;
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(key_auth_digest)];
    let cert = params.self_signed(&key).map_err(|e| GateError::Acme(e.to_string()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
        PrivatePkcs8KeyDer::from(key.serialize_der()),
    ))
    .map_err(|e| GateError::Tls(e.to_string()))?;
    let der: CertificateDer<'static> = cert.der().clone();
    Ok(Arc::new(CertifiedKey::new(vec![der], signing_key)))
}

fn acme_err(e: impl fmt::Display) -> GateError {
    GateError::Acme(e.to_string())
}

/// Serves pending TLS-ALPN-01 challenge certificates by exact SNI.
struct ChallengeResolver {
    inner: Arc<AcmeInner>,
}

impl fmt::Debug for ChallengeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChallengeResolver")
    }
}

impl ResolvesServerCert for ChallengeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_lowercase();
        self.inner.challenges.get(&name).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::tls::init_crypto;

    #[test]
    fn challenge_cert_carries_acme_extension() {
        init_crypto();
        let digest = [0u8; 32];
        let key = challenge_cert("a.example", &digest).unwrap();
        let (_, cert) = X509Certificate::from_der(key.cert[0].as_ref()).unwrap();
        // id-pe-acmeIdentifier
        assert!(cert
            .extensions()
            .iter()
            .any(|e| e.oid.to_id_string() == "1.3.6.1.5.5.7.1.31"));
    }

    #[test]
    fn domains_are_deduped_and_ips_dropped() {
        let manager = AcmeManager::new("ops@example.com", None, "/tmp/tlsgate-acme-test").unwrap();
        manager.set_domains(vec![
            "A.example".to_string(),
            "a.example".to_string(),
            "127.0.0.1".to_string(),
        ]);
        assert_eq!(
            manager.inner.domains.lock().unwrap().as_slice(),
            &["a.example".to_string()]
        );
    }
}
