use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Mode;
use crate::core::backend::Backend;
use crate::core::proxy::Proxy;
use crate::networking::conn::TrackedConn;

pub type HandoffStream = tokio_rustls::server::TlsStream<TrackedConn<TcpStream>>;

const HANDOFF_QUEUE: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MAX_PROXIED_BODY: usize = 16 * 1024 * 1024;

/// An authorized TLS session handed from the dispatcher to a backend's
/// in-process HTTP server, which owns it from here on.
pub struct Handoff {
    pub stream: HandoffStream,
    pub peer: SocketAddr,
}

/// Handle to one backend's in-process HTTP server.
pub struct HttpServerHandle {
    tx: mpsc::Sender<Handoff>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServerHandle {
    /// Hands a connection to the server. Returns false when the server is
    /// already shutting down; the caller just drops the connection.
    pub async fn send(&self, handoff: Handoff) -> bool {
        self.tx.send(handoff).await.is_ok()
    }

    /// Stops accepting handoffs and gives in-flight sessions a grace
    /// period to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("HTTP server did not drain within {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}

/// Starts the per-backend HTTP server fed by the handoff channel.
pub fn spawn_backend_server(proxy: Arc<Proxy>, backend: Arc<Backend>) -> HttpServerHandle {
    let (tx, mut rx) = mpsc::channel::<Handoff>(HANDOFF_QUEUE);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = server_cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(handoff) => {
                        let proxy = proxy.clone();
                        let backend = backend.clone();
                        sessions.spawn(serve_session(proxy, backend, handoff));
                    }
                    None => break,
                },
            }
        }
        // Refuse further handoffs, then drain what is already in flight.
        rx.close();
        while let Some(handoff) = rx.recv().await {
            drop(handoff);
        }
        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    sessions.abort_all();
                    break;
                }
                joined = sessions.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }
    });

    HttpServerHandle {
        tx,
        cancel,
        task: Mutex::new(Some(task)),
    }
}

async fn serve_session(proxy: Arc<Proxy>, backend: Arc<Backend>, handoff: Handoff) {
    let peer = handoff.peer;
    let io = TokioIo::new(handoff.stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        let backend = backend.clone();
        async move {
            Ok::<_, std::convert::Infallible>(handle_request(proxy, backend, peer, req).await)
        }
    });
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!("HTTP session from {} ended: {}", peer, e);
    }
}

async fn handle_request(
    proxy: Arc<Proxy>,
    backend: Arc<Backend>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let email = match sso_gate(&proxy, &backend, &req).await {
        Gate::Respond(resp) => return resp,
        Gate::Pass(email) => email,
    };
    match backend.mode {
        Mode::Console => console(&proxy, &req),
        _ => forward(&proxy, &backend, peer, email, req).await,
    }
}

enum Gate {
    Pass(Option<String>),
    Respond(Response<Full<Bytes>>),
}

async fn sso_gate(proxy: &Arc<Proxy>, backend: &Arc<Backend>, req: &Request<Incoming>) -> Gate {
    if !backend.sso {
        return Gate::Pass(None);
    }
    let Some(oidc) = proxy.oidc() else {
        return Gate::Pass(None);
    };
    if oidc.is_callback(req.uri().path()) {
        return Gate::Respond(oidc.handle_callback(&query_params(req.uri())).await);
    }
    if let Some(email) = oidc.authenticate(req.headers()) {
        return Gate::Pass(Some(email));
    }
    let host = request_host(req).unwrap_or_else(|| backend.server_names[0].clone());
    let original = format!(
        "https://{}{}",
        host,
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    Gate::Respond(oidc.request_login(original))
}

fn console(proxy: &Arc<Proxy>, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/" => plain(StatusCode::OK, &proxy.console_page()),
        "/config" => plain(StatusCode::OK, &proxy.config_yaml()),
        "/favicon.ico" => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(Bytes::new()))
            .unwrap(),
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn forward(
    proxy: &Arc<Proxy>,
    backend: &Arc<Backend>,
    peer: SocketAddr,
    email: Option<String>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(client) = backend.http_client.as_ref() else {
        return plain(StatusCode::BAD_GATEWAY, "no upstream client");
    };
    let addr = backend.next_address();
    let scheme = if backend.mode == Mode::Https { "https" } else { "http" };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("{}://{}{}", scheme, addr, path_and_query);

    let method = req.method().clone();
    let host = request_host(&req);
    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);

    let body = match Limited::new(req.into_body(), MAX_PROXIED_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let mut builder = client
        .request(method, url.as_str())
        .headers(headers)
        .header("x-forwarded-for", peer.ip().to_string())
        .header("x-forwarded-proto", "https")
        .body(body);
    if let Some(host) = host {
        builder = builder.header("x-forwarded-host", host);
    }
    if let Some(email) = email {
        builder = builder.header("x-auth-email", email);
    }

    let upstream = match builder.send().await {
        Ok(resp) => resp,
        Err(e) => {
            debug!("Upstream request to {} failed: {}", url, e);
            proxy.events().record("dial error");
            return plain(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
    };

    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) && name != CONTENT_LENGTH {
            response = response.header(name, value);
        }
    }
    let bytes = upstream.bytes().await.unwrap_or_default();
    response.body(Full::new(bytes)).unwrap()
}

/// Serves the plain-HTTP listener: ACME HTTP-01 probes are answered from
/// the certificate manager, everything else is redirected to HTTPS.
pub async fn run_http_listener(proxy: Arc<Proxy>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("HTTP accept error: {}", e);
                    continue;
                }
            },
        };
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let proxy = proxy.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(http_fallback(proxy, req).await)
                }
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                debug!("HTTP listener session from {} ended: {}", peer, e);
            }
        });
    }
}

async fn http_fallback(proxy: Arc<Proxy>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    if let Some(token) = path.strip_prefix("/.well-known/acme-challenge/") {
        return match proxy.cert_manager().http01_key_auth(token) {
            Some(key_auth) => plain(StatusCode::OK, &key_auth),
            None => plain(StatusCode::NOT_FOUND, "unknown challenge"),
        };
    }
    let host = request_host(&req).unwrap_or_default();
    if host.is_empty() {
        return plain(StatusCode::BAD_REQUEST, "missing host");
    }
    let target = format!(
        "https://{}{}",
        host,
        req.uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, target)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.host().to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string())
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|n| is_hop_by_hop(n))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

pub(crate) fn plain(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
