use futures::FutureExt;
use log::{debug, info};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::common::io::bridge;
use crate::config::Mode;
use crate::core::backend::Backend;
use crate::core::proxy::Proxy;
use crate::httpd::{Handoff, HandoffStream};
use crate::metrics;
use crate::networking::acl::subject_allowed;
use crate::networking::clienthello::read_client_hello;
use crate::networking::conn::{ConnState, TrackedConn};
use crate::networking::tls::{
    send_alert, subject_dn, ACME_TLS_ALPN, ALERT_CLOSE_NOTIFY, ALERT_INTERNAL_ERROR,
    ALERT_LEVEL_FATAL, ALERT_LEVEL_WARNING, ALERT_UNRECOGNIZED_NAME,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection-task entry point. The unwind boundary keeps one broken
/// session from taking down the accept loop or its siblings.
pub async fn handle_connection(proxy: Arc<Proxy>, stream: TcpStream, peer: SocketAddr) {
    let outcome = AssertUnwindSafe(dispatch(proxy.clone(), stream, peer))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        proxy.events().record("panic");
    }
}

async fn dispatch(proxy: Arc<Proxy>, mut stream: TcpStream, peer: SocketAddr) {
    let Ok(local) = stream.local_addr() else {
        return;
    };

    if proxy.open_connections() >= proxy.max_open() {
        proxy.events().record("too many open connections");
        send_alert(&mut stream, ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY).await;
        return;
    }

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to enable keepalive for {}: {}", peer, e);
    }

    let state = ConnState::new(peer, local);
    let key = (local, peer);
    proxy.register(key, state.clone());

    let mut conn = TrackedConn::new(stream, &state);
    {
        let proxy = proxy.clone();
        let state = state.clone();
        conn.set_on_close(move || {
            proxy.unregister(&key);
            if state.mode().is_some() {
                if let Some(sn) = state.server_name() {
                    metrics::ACTIVE_CONNECTIONS.with_label_values(&[&sn]).dec();
                    metrics::CONNECTION_DURATION
                        .with_label_values(&[&sn])
                        .observe(state.start.elapsed().as_secs_f64());
                }
            }
            if state.report_end() {
                info!("END {}", state.summary());
            }
        });
    }

    // Decode the ClientHello without consuming it: the raw flight is
    // replayed ahead of whatever reads the connection next.
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_client_hello(&mut conn)).await;
    let (raw, hello) = match hello {
        Ok(Ok(decoded)) => decoded,
        _ => {
            proxy.events().record("invalid ClientHello");
            debug!("BAD {}: invalid ClientHello", peer);
            return;
        }
    };
    conn.set_prefix(raw);

    let sni = hello.server_name.clone().unwrap_or_default();
    let server_name = if sni.is_empty() {
        proxy.events().record("no SNI");
        proxy.default_server_name()
    } else {
        sni.to_lowercase()
    };
    state.set_server_name(&server_name);

    let Some(backend) = proxy.backend(&server_name) else {
        proxy.events().record("unexpected SNI");
        debug!("BAD {}: unexpected SNI {:?}", peer, server_name);
        send_alert(&mut conn, ALERT_LEVEL_FATAL, ALERT_UNRECOGNIZED_NAME).await;
        return;
    };

    state.set_mode(backend.mode);
    metrics::TOTAL_CONNECTIONS.with_label_values(&[&server_name]).inc();
    metrics::ACTIVE_CONNECTIONS.with_label_values(&[&server_name]).inc();

    // The ALPN-01 validator connects with exactly this protocol; answer it
    // with the pending challenge certificate whatever the backend's mode.
    if hello.alpn.len() == 1 && hello.alpn[0] == ACME_TLS_ALPN && !server_name.is_empty() {
        let acceptor = TlsAcceptor::from(proxy.challenge_tls_config());
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)).await {
            Ok(Ok(_stream)) => debug!("Completed acme-tls/1 handshake for {}", server_name),
            Ok(Err(e)) => debug!("acme-tls/1 handshake for {} failed: {}", server_name, e),
            Err(_) => debug!("acme-tls/1 handshake for {} timed out", server_name),
        }
        return;
    }

    if let Err(reason) = backend.check_ip(peer.ip()) {
        proxy
            .events()
            .record(format!("{} CheckIP {}", server_name, reason));
        debug!("BAD {}: IP rejected for {} ({})", peer, server_name, reason);
        send_alert(&mut conn, ALERT_LEVEL_FATAL, ALERT_UNRECOGNIZED_NAME).await;
        return;
    }

    if backend.mode == Mode::TlsPassthrough {
        let (mut upstream, _) = match backend.dial().await {
            Ok(dialed) => dialed,
            Err(e) => {
                proxy.events().record("dial error");
                debug!("ERR {}: passthrough dial for {} failed: {}", peer, server_name, e);
                send_alert(&mut conn, ALERT_LEVEL_FATAL, ALERT_INTERNAL_ERROR).await;
                return;
            }
        };
        state.set_dial_done();
        state.set_report_end();
        run_bridge(&state, &server_name, &mut conn, &mut upstream).await;
        return;
    }

    // Terminating modes from here on.
    let Some(tls_config) = backend.tls_config.clone() else {
        debug!("BAD {}: no TLS config for {}", peer, server_name);
        return;
    };
    let acceptor = TlsAcceptor::from(tls_config);
    let accepted = tokio::select! {
        done = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(conn)) => done,
        _ = proxy.cancel_token().cancelled() => return,
    };
    let tls_stream: HandoffStream = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let msg = e.to_string();
            if msg.contains("access denied") {
                proxy.events().record("access denied");
            } else {
                proxy.events().record("tls handshake failed");
            }
            debug!("BAD {}: handshake for {} failed: {}", peer, server_name, msg);
            return;
        }
        Err(_) => {
            proxy.events().record("tls handshake failed");
            debug!("BAD {}: handshake for {} timed out", peer, server_name);
            return;
        }
    };

    if let Err(event) = authorize_tls_connection(&proxy, &state, &backend, &tls_stream) {
        proxy.events().record(event);
        debug!("BAD {}: {} for {}", peer, event, server_name);
        return;
    }

    if backend.limiter.acquire(proxy.cancel_token()).await.is_err() {
        return;
    }

    if backend.mode.is_http_family() {
        state.set_report_end();
        if let Some(server) = backend.http.get() {
            let handoff = Handoff {
                stream: tls_stream,
                peer,
            };
            if !server.send(handoff).await {
                debug!("HTTP server for {} refused handoff", server_name);
            }
        }
        return;
    }

    let mut tls_stream = tls_stream;
    match backend.mode {
        Mode::Tcp => {
            let (mut upstream, _) = match backend.dial().await {
                Ok(dialed) => dialed,
                Err(e) => {
                    proxy.events().record("dial error");
                    debug!("ERR {}: dial for {} failed: {}", peer, server_name, e);
                    return;
                }
            };
            state.set_dial_done();
            state.set_report_end();
            run_bridge(&state, &server_name, &mut tls_stream, &mut upstream).await;
        }
        Mode::Tls => {
            let alpn = state.alpn();
            let mut upstream = match backend.dial_tls(alpn.as_deref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    proxy.events().record("dial error");
                    debug!("ERR {}: TLS dial for {} failed: {}", peer, server_name, e);
                    return;
                }
            };
            state.set_dial_done();
            state.set_report_end();
            run_bridge(&state, &server_name, &mut tls_stream, &mut upstream).await;
        }
        other => {
            debug!("BAD {}: unhandled mode {} for {}", peer, other.as_str(), server_name);
        }
    }
}

/// Post-handshake authorization: records handshake progress, enforces
/// server-name consistency, and re-runs the subject ACL check that the
/// in-handshake verifier already applied.
fn authorize_tls_connection(
    proxy: &Arc<Proxy>,
    state: &ConnState,
    backend: &Arc<Backend>,
    tls_stream: &HandoffStream,
) -> Result<(), &'static str> {
    let (_, session) = tls_stream.get_ref();

    let alpn = session
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned());
    state.set_handshake_done(alpn);

    let negotiated = match session.server_name() {
        Some(name) if !name.is_empty() => name.to_lowercase(),
        _ => proxy.default_server_name(),
    };
    if Some(&negotiated) != state.server_name().as_ref() {
        return Err("mismatched server name");
    }

    match session.peer_certificates().and_then(|certs| certs.first()) {
        Some(leaf) => {
            let Ok(subject) = subject_dn(leaf.as_ref()) else {
                return Err("access denied");
            };
            if !subject_allowed(backend.client_acl.as_deref(), &subject) {
                return Err("access denied");
            }
            state.set_client_subject(&subject);
        }
        None if backend.client_auth => return Err("access denied"),
        None => {}
    }
    Ok(())
}

async fn run_bridge<A, B>(state: &ConnState, server_name: &str, external: &mut A, internal: &mut B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match bridge(external, internal).await {
        Ok((recv, sent)) => {
            state.set_transfer(recv, sent);
            metrics::TRAFFIC_BYTES
                .with_label_values(&[server_name, "client_in"])
                .inc_by(recv);
            metrics::TRAFFIC_BYTES
                .with_label_values(&[server_name, "client_out"])
                .inc_by(sent);
        }
        Err(e) => {
            // Normal at session teardown; peers rarely close cleanly.
            debug!("ERR bridge for {} ended: {}", server_name, e);
        }
    }
}
