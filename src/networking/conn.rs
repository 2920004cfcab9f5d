use bytes::{Buf, Bytes};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::Mode;

/// Typed per-connection context. The dispatch task is the only writer; the
/// close callback and the console page read it through the shared `Arc`.
pub struct ConnState {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub start: Instant,
    pub bytes_received: Arc<AtomicU64>,
    pub bytes_sent: Arc<AtomicU64>,
    progress: Mutex<Progress>,
}

#[derive(Default)]
struct Progress {
    handshake_done: Option<Instant>,
    dial_done: Option<Instant>,
    server_name: Option<String>,
    mode: Option<Mode>,
    alpn: Option<String>,
    client_subject: Option<String>,
    report_end: bool,
    // Plaintext totals recorded by the bridge; for terminated modes these
    // are the application bytes, not the wire framing.
    recv: u64,
    sent: u64,
}

impl ConnState {
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr) -> Arc<Self> {
        Arc::new(ConnState {
            peer_addr,
            local_addr,
            start: Instant::now(),
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            progress: Mutex::new(Progress::default()),
        })
    }

    pub fn set_server_name(&self, name: &str) {
        self.progress.lock().unwrap().server_name = Some(name.to_string());
    }

    pub fn server_name(&self) -> Option<String> {
        self.progress.lock().unwrap().server_name.clone()
    }

    pub fn set_mode(&self, mode: Mode) {
        self.progress.lock().unwrap().mode = Some(mode);
    }

    pub fn mode(&self) -> Option<Mode> {
        self.progress.lock().unwrap().mode
    }

    pub fn set_handshake_done(&self, alpn: Option<String>) {
        let mut p = self.progress.lock().unwrap();
        p.handshake_done = Some(Instant::now());
        p.alpn = alpn;
    }

    pub fn alpn(&self) -> Option<String> {
        self.progress.lock().unwrap().alpn.clone()
    }

    pub fn set_dial_done(&self) {
        self.progress.lock().unwrap().dial_done = Some(Instant::now());
    }

    pub fn set_client_subject(&self, subject: &str) {
        self.progress.lock().unwrap().client_subject = Some(subject.to_string());
    }

    pub fn client_subject(&self) -> Option<String> {
        self.progress.lock().unwrap().client_subject.clone()
    }

    pub fn set_report_end(&self) {
        self.progress.lock().unwrap().report_end = true;
    }

    pub fn report_end(&self) -> bool {
        self.progress.lock().unwrap().report_end
    }

    pub fn set_transfer(&self, recv: u64, sent: u64) {
        let mut p = self.progress.lock().unwrap();
        p.recv = recv;
        p.sent = sent;
    }

    pub fn transfer(&self) -> (u64, u64) {
        let p = self.progress.lock().unwrap();
        (p.recv, p.sent)
    }

    /// One-line end-of-connection summary.
    pub fn summary(&self) -> String {
        let p = self.progress.lock().unwrap();
        let hs = p
            .handshake_done
            .map(|t| t.duration_since(self.start))
            .unwrap_or(Duration::ZERO);
        let dial = match (p.handshake_done, p.dial_done) {
            (Some(h), Some(d)) => d.duration_since(h),
            _ => Duration::ZERO,
        };
        format!(
            "{} sn={} mode={} recv={} sent={} hs={:?} dial={:?} total={:?}",
            self.peer_addr,
            p.server_name.as_deref().unwrap_or("-"),
            p.mode.map(|m| m.as_str()).unwrap_or("-"),
            p.recv,
            p.sent,
            hs,
            dial,
            self.start.elapsed(),
        )
    }
}

/// Owns the accepted socket. Replays the buffered ClientHello flight ahead
/// of socket reads, counts wire bytes both ways, and fires the registered
/// close callback exactly once when dropped.
pub struct TrackedConn<S> {
    inner: S,
    prefix: Bytes,
    bytes_received: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> TrackedConn<S> {
    pub fn new(inner: S, state: &ConnState) -> Self {
        TrackedConn {
            inner,
            prefix: Bytes::new(),
            bytes_received: state.bytes_received.clone(),
            bytes_sent: state.bytes_sent.clone(),
            on_close: None,
        }
    }

    /// Bytes already read off the socket that must be served to the next
    /// reader before any fresh socket data.
    pub fn set_prefix(&mut self, prefix: Bytes) {
        self.prefix = prefix;
    }

    pub fn set_on_close(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_close = Some(Box::new(f));
    }
}

impl<S> Drop for TrackedConn<S> {
    fn drop(&mut self) {
        if let Some(f) = self.on_close.take() {
            f();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                this.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("1.2.3.4:1000".parse().unwrap(), "5.6.7.8:443".parse().unwrap())
    }

    #[tokio::test]
    async fn replays_prefix_before_socket_reads() {
        let (peer, local) = addrs();
        let state = ConnState::new(peer, local);
        let (mut far, near) = tokio::io::duplex(1024);
        let mut conn = TrackedConn::new(near, &state);
        conn.set_prefix(Bytes::from_static(b"hello "));

        far.write_all(b"world").await.unwrap();
        far.shutdown().await.unwrap();

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        // Only the socket bytes hit the wire counter.
        assert_eq!(state.bytes_received.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn counts_written_bytes() {
        let (peer, local) = addrs();
        let state = ConnState::new(peer, local);
        let (mut far, near) = tokio::io::duplex(1024);
        let mut conn = TrackedConn::new(near, &state);

        conn.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 5];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(state.bytes_sent.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn close_callback_fires_exactly_once() {
        let (peer, local) = addrs();
        let state = ConnState::new(peer, local);
        let (_far, near) = tokio::io::duplex(64);
        let mut conn = TrackedConn::new(near, &state);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        conn.set_on_close(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        drop(conn);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
