use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    MissingField(String),
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

/// Top-level configuration. Field names follow the config file format, so
/// the YAML keys are the canonical spelling.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(rename = "TLSAddr")]
    pub tls_addr: String,
    #[serde(rename = "HTTPAddr", default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
    #[serde(rename = "CacheDir", default)]
    pub cache_dir: String,
    #[serde(rename = "Email", default)]
    pub email: String,
    #[serde(rename = "DefaultServerName", default)]
    pub default_server_name: String,
    #[serde(rename = "MaxOpen", default = "default_max_open")]
    pub max_open: usize,
    #[serde(rename = "ACMEDirectory", default, skip_serializing_if = "Option::is_none")]
    pub acme_directory: Option<String>,
    #[serde(rename = "OIDC", default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,
    #[serde(rename = "Backends", default)]
    pub backends: Vec<BackendConfig>,
}

fn default_max_open() -> usize {
    2048
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BackendConfig {
    #[serde(rename = "ServerNames")]
    pub server_names: Vec<String>,
    #[serde(rename = "Mode")]
    pub mode: Mode,
    #[serde(rename = "Addresses", default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(rename = "ALPNProtos", default, skip_serializing_if = "Option::is_none")]
    pub alpn_protos: Option<Vec<String>>,
    #[serde(rename = "ClientAuth", default)]
    pub client_auth: bool,
    /// Inline PEM or an absolute file path.
    #[serde(rename = "ClientCAs", default, skip_serializing_if = "Option::is_none")]
    pub client_cas: Option<String>,
    #[serde(rename = "ClientACL", default, skip_serializing_if = "Option::is_none")]
    pub client_acl: Option<Vec<String>>,
    /// Inline PEM or an absolute file path.
    #[serde(rename = "ForwardRootCAs", default, skip_serializing_if = "Option::is_none")]
    pub forward_root_cas: Option<String>,
    #[serde(rename = "AllowIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub allow_ips: Vec<String>,
    #[serde(rename = "DenyIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub deny_ips: Vec<String>,
    #[serde(rename = "RateLimit", default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(rename = "SSO", default)]
    pub sso: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[serde(rename = "TLSPassthrough", alias = "tlspassthrough", alias = "passthrough")]
    TlsPassthrough,
    #[serde(rename = "TLS", alias = "tls")]
    Tls,
    #[serde(rename = "TCP", alias = "tcp")]
    Tcp,
    #[serde(rename = "HTTP", alias = "http")]
    Http,
    #[serde(rename = "HTTPS", alias = "https")]
    Https,
    #[serde(rename = "Console", alias = "console")]
    Console,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::TlsPassthrough => "TLSPassthrough",
            Mode::Tls => "TLS",
            Mode::Tcp => "TCP",
            Mode::Http => "HTTP",
            Mode::Https => "HTTPS",
            Mode::Console => "Console",
        }
    }

    /// Modes whose sessions are owned by an in-process HTTP server.
    pub fn is_http_family(&self) -> bool {
        matches!(self, Mode::Http | Mode::Https | Mode::Console)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    #[serde(rename = "RequestsPerSecond")]
    pub requests_per_second: u32,
    #[serde(rename = "Burst", default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OidcConfig {
    #[serde(rename = "ClientID")]
    pub client_id: String,
    #[serde(rename = "ClientSecret")]
    pub client_secret: String,
    #[serde(rename = "AuthEndpoint")]
    pub auth_endpoint: String,
    #[serde(rename = "TokenEndpoint")]
    pub token_endpoint: String,
    #[serde(rename = "RedirectURL")]
    pub redirect_url: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tls_addr.is_empty() {
            return Err(ConfigError::MissingField("TLSAddr".to_string()));
        }
        check_listen_addr("TLSAddr", &self.tls_addr)?;
        if let Some(addr) = &self.http_addr {
            check_listen_addr("HTTPAddr", addr)?;
        }
        if self.backends.is_empty() {
            return Err(ConfigError::MissingField("Backends".to_string()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.server_names.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "backend {} has no server names",
                    i
                )));
            }
            for name in &backend.server_names {
                if name.is_empty() {
                    return Err(ConfigError::InvalidValue(format!(
                        "backend {} has an empty server name",
                        i
                    )));
                }
                if !seen.insert(name.to_lowercase()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "server name '{}' appears in more than one backend",
                        name
                    )));
                }
            }
            match backend.mode {
                Mode::Console => {}
                _ => {
                    if backend.addresses.is_empty() {
                        return Err(ConfigError::InvalidValue(format!(
                            "backend {} mode {} needs at least one address",
                            i,
                            backend.mode.as_str()
                        )));
                    }
                }
            }
            for addr in &backend.addresses {
                check_dial_addr(addr)?;
            }
            if backend.client_acl.is_some() && !backend.client_auth {
                return Err(ConfigError::InvalidValue(format!(
                    "backend {} sets ClientACL without ClientAuth",
                    i
                )));
            }
            if backend.client_auth && backend.client_cas.is_none() {
                return Err(ConfigError::InvalidValue(format!(
                    "backend {} sets ClientAuth without ClientCAs",
                    i
                )));
            }
            if backend.sso {
                if !backend.mode.is_http_family() {
                    return Err(ConfigError::InvalidValue(format!(
                        "backend {} sets SSO on non-HTTP mode {}",
                        i,
                        backend.mode.as_str()
                    )));
                }
                if self.oidc.is_none() {
                    return Err(ConfigError::InvalidValue(format!(
                        "backend {} sets SSO but no OIDC provider is configured",
                        i
                    )));
                }
            }
        }

        if !self.default_server_name.is_empty()
            && !seen.contains(&self.default_server_name.to_lowercase())
        {
            return Err(ConfigError::InvalidValue(format!(
                "DefaultServerName '{}' does not match any backend",
                self.default_server_name
            )));
        }
        Ok(())
    }

    pub fn backend_for(&self, server_name: &str) -> Option<&BackendConfig> {
        let want = server_name.to_lowercase();
        self.backends
            .iter()
            .find(|b| b.server_names.iter().any(|n| n.to_lowercase() == want))
    }
}

fn check_listen_addr(field: &str, addr: &str) -> Result<(), ConfigError> {
    addr.parse::<std::net::SocketAddr>()
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidValue(format!("{} '{}': {}", field, addr, e)))
}

fn check_dial_addr(addr: &str) -> Result<(), ConfigError> {
    // Upstream addresses may be hostnames; only the port is checked here.
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ConfigError::InvalidValue(format!(
            "address '{}' is not host:port",
            addr
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
TLSAddr: "0.0.0.0:8443"
HTTPAddr: "0.0.0.0:8080"
CacheDir: "/var/cache/tlsgate"
Email: "admin@example.com"
DefaultServerName: "a.example"
MaxOpen: 100
Backends:
  - ServerNames: ["a.example"]
    Mode: TCP
    Addresses: ["127.0.0.1:9000"]
    RateLimit:
      RequestsPerSecond: 10
      Burst: 20
  - ServerNames: ["b.example", "c.example"]
    Mode: TLSPassthrough
    Addresses: ["upstream.internal:443"]
"#;

    #[test]
    fn parses_and_validates_sample() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_open, 100);
        assert_eq!(config.backends[0].mode, Mode::Tcp);
        assert_eq!(config.backends[1].mode, Mode::TlsPassthrough);
        assert!(config.backend_for("B.EXAMPLE").is_some());
        assert!(config.backend_for("missing.example").is_none());
    }

    #[test]
    fn rejects_duplicate_server_names() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.backends[1].server_names.push("a.example".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_acl_without_client_auth() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.backends[0].client_acl = Some(vec!["CN=alice".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_default_server_name() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.default_server_name = "nope.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_dial_address() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.backends[0].addresses = vec!["no-port".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_mode_fails_to_parse() {
        let yaml = SAMPLE.replace("Mode: TCP", "Mode: QUIC");
        assert!(serde_yaml::from_str::<Config>(&yaml).is_err());
    }
}
