use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use http_body_util::Full;
use hyper::header::{HeaderMap, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use hyper::{Response, StatusCode};
use log::debug;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::config::OidcConfig;
use crate::metrics::Events;

type HmacSha256 = Hmac<Sha256>;

const STATE_TTL: Duration = Duration::from_secs(5 * 60);
const COOKIE_NAME: &str = "TLSGATE_AUTH";
const COOKIE_TTL_SECS: u64 = 12 * 3600;

struct LoginState {
    created: Instant,
    original_url: String,
    code_verifier: String,
    seen: bool,
}

/// Authorization-code + PKCE login flow against a single OIDC provider.
/// Identity-gated HTTP backends redirect unauthenticated requests through
/// `request_login` and hand the provider's redirect back to
/// `handle_callback`; the issued cookie carries the verified email.
pub struct OidcProvider {
    config: OidcConfig,
    callback_path: String,
    states: Mutex<HashMap<String, LoginState>>,
    http: reqwest::Client,
    cookie_key: [u8; 32],
    events: Arc<Events>,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: String,
}

#[derive(Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: String,
    email_verified: Option<bool>,
    #[serde(default)]
    nonce: String,
}

impl OidcProvider {
    pub fn new(config: OidcConfig, events: Arc<Events>) -> Self {
        let callback_path = Url::parse(&config.redirect_url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/oauth2/callback".to_string());
        let mut cookie_key = [0u8; 32];
        rand::rng().fill_bytes(&mut cookie_key);
        OidcProvider {
            config,
            callback_path,
            states: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
            cookie_key,
            events,
        }
    }

    pub fn is_callback(&self, path: &str) -> bool {
        path == self.callback_path
    }

    /// Starts a login: records the pending state and redirects the client
    /// to the authorization endpoint.
    pub fn request_login(&self, original_url: String) -> Response<Full<Bytes>> {
        self.events.record("oidc auth request");

        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        let mut verifier_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut verifier_bytes);
        let code_verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        self.states.lock().unwrap().insert(
            nonce.clone(),
            LoginState {
                created: Instant::now(),
                original_url,
                code_verifier,
                seen: false,
            },
        );

        let mut url = match Url::parse(&self.config.auth_endpoint) {
            Ok(u) => u,
            Err(e) => return plain(StatusCode::INTERNAL_SERVER_ERROR, &format!("bad auth endpoint: {}", e)),
        };
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", "openid email")
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("state", &nonce)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, url.as_str())
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    /// Completes (or aborts) a login round-trip at the redirect URL.
    pub async fn handle_callback(&self, params: &HashMap<String, String>) -> Response<Full<Bytes>> {
        self.events.record("oidc auth callback");

        if params.contains_key("logout") {
            let mut resp = plain(StatusCode::OK, "logged out");
            resp.headers_mut().insert(
                SET_COOKIE,
                format!("{}=; Path=/; Max-Age=0; Secure; HttpOnly", COOKIE_NAME)
                    .parse()
                    .unwrap(),
            );
            return resp;
        }

        // Drop pending logins that were never completed.
        self.states
            .lock()
            .unwrap()
            .retain(|_, s| s.created.elapsed() < STATE_TTL);

        let state_param = params.get("state").cloned().unwrap_or_default();
        let code = params.get("code").cloned().unwrap_or_default();

        let (original_url, code_verifier) = {
            let mut states = self.states.lock().unwrap();
            match states.get_mut(&state_param) {
                None => {
                    self.events.record("invalid state");
                    return plain(StatusCode::BAD_REQUEST, "invalid state");
                }
                Some(state) if state.seen => {
                    self.events.record("invalid state");
                    return plain(StatusCode::BAD_REQUEST, "invalid state");
                }
                Some(state) => {
                    state.seen = true;
                    (state.original_url.clone(), state.code_verifier.clone())
                }
            }
        };

        let token = match self.exchange_code(&code, &code_verifier).await {
            Ok(t) => t,
            Err(e) => {
                debug!("OIDC token exchange failed: {}", e);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "token exchange failed");
            }
        };

        // The token arrived over TLS directly from the IdP; the signature
        // is not re-verified here.
        let claims = match decode_id_token(&token.id_token) {
            Ok(c) => c,
            Err(e) => {
                debug!("OIDC ID token decode failed: {}", e);
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "bad ID token");
            }
        };

        if self.states.lock().unwrap().remove(&claims.nonce).is_none() {
            self.events.record("invalid nonce");
            return plain(StatusCode::FORBIDDEN, "timeout");
        }

        if claims.email_verified == Some(false) {
            self.events.record("email not verified");
            return plain(StatusCode::FORBIDDEN, "email not verified");
        }

        let cookie = self.auth_cookie(&claims.email, &claims.nonce);
        Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(LOCATION, original_url)
            .header(
                SET_COOKIE,
                format!(
                    "{}={}; Path=/; Max-Age={}; Secure; HttpOnly; SameSite=Lax",
                    COOKIE_NAME, cookie, COOKIE_TTL_SECS
                ),
            )
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse, String> {
        let resp = self
            .http
            .post(&self.config.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", code_verifier),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", &self.config.redirect_url),
            ])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("token endpoint returned {}", resp.status()));
        }
        resp.json::<TokenResponse>().await.map_err(|e| e.to_string())
    }

    fn auth_cookie(&self, email: &str, nonce: &str) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            + COOKIE_TTL_SECS;
        let payload = serde_json::json!({"email": email, "nonce": nonce, "exp": exp}).to_string();
        let mut mac = HmacSha256::new_from_slice(&self.cookie_key).unwrap();
        mac.update(payload.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        )
    }

    /// Validates the auth cookie on a request; returns the signed-in email.
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<String> {
        let token = cookie_value(headers, COOKIE_NAME)?;
        let (payload_b64, mac_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let sig = URL_SAFE_NO_PAD.decode(mac_b64).ok()?;
        let mut mac = HmacSha256::new_from_slice(&self.cookie_key).unwrap();
        mac.update(&payload);
        mac.verify_slice(&sig).ok()?;

        #[derive(Deserialize)]
        struct CookiePayload {
            email: String,
            exp: u64,
        }
        let parsed: CookiePayload = serde_json::from_slice(&payload).ok()?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        if parsed.exp <= now {
            return None;
        }
        Some(parsed.email)
    }
}

fn decode_id_token(token: &str) -> Result<IdTokenClaims, String> {
    let mut parts = token.split('.');
    let _header = parts.next().ok_or("missing header")?;
    let payload = parts.next().ok_or("missing payload")?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
