use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const BRIDGE_BUF_SIZE: usize = 16 * 1024;

/// Couples an external (client-facing) stream with an internal (upstream)
/// stream and shuttles bytes both ways until both directions have drained.
///
/// EOF on one direction half-closes the write side of the opposite stream,
/// so a peer that shuts down its send path still receives the tail of the
/// response. The first I/O error tears the whole bridge down. Resolves to
/// `(external_to_internal, internal_to_external)` byte totals.
pub fn bridge<'a, A, B>(external: &'a mut A, internal: &'a mut B) -> Bridge<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Bridge {
        external,
        internal,
        out: Flow::new(),
        back: Flow::new(),
    }
}

pub struct Bridge<'a, A: ?Sized, B: ?Sized> {
    external: &'a mut A,
    internal: &'a mut B,
    out: Flow,
    back: Flow,
}

struct Flow {
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
    total: u64,
    read_done: bool,
    shutdown_done: bool,
}

impl Flow {
    fn new() -> Self {
        Flow {
            buf: vec![0; BRIDGE_BUF_SIZE],
            pos: 0,
            cap: 0,
            total: 0,
            read_done: false,
            shutdown_done: false,
        }
    }

    // One pump step for a single direction. Returns true if any progress
    // was made so the outer loop knows whether to go around again.
    fn pump<R, W>(&mut self, cx: &mut Context<'_>, reader: &mut R, writer: &mut W) -> io::Result<bool>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.shutdown_done {
            return Ok(false);
        }
        let mut progressed = false;

        if self.pos < self.cap {
            match Pin::new(&mut *writer).poll_write(cx, &self.buf[self.pos..self.cap]) {
                Poll::Ready(Ok(0)) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero byte during transfer"));
                }
                Poll::Ready(Ok(n)) => {
                    self.pos += n;
                    self.total += n as u64;
                    progressed = true;
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {}
            }
        }

        if self.pos == self.cap && !self.read_done {
            self.pos = 0;
            self.cap = 0;
            let mut rb = ReadBuf::new(&mut self.buf);
            match Pin::new(&mut *reader).poll_read(cx, &mut rb) {
                Poll::Ready(Ok(())) => {
                    let n = rb.filled().len();
                    if n == 0 {
                        self.read_done = true;
                    } else {
                        self.cap = n;
                    }
                    progressed = true;
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {}
            }
        }

        // Source drained and buffer flushed: propagate EOF to the peer.
        if self.read_done && self.pos == self.cap {
            match Pin::new(writer).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {
                    self.shutdown_done = true;
                    progressed = true;
                }
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {}
            }
        }

        Ok(progressed)
    }
}

impl<'a, A, B> Future for Bridge<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<(u64, u64)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = &mut *self;
        loop {
            let fwd = match me.out.pump(cx, &mut *me.external, &mut *me.internal) {
                Ok(p) => p,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let rev = match me.back.pump(cx, &mut *me.internal, &mut *me.external) {
                Ok(p) => p,
                Err(e) => return Poll::Ready(Err(e)),
            };

            if me.out.shutdown_done && me.back.shutdown_done {
                return Poll::Ready(Ok((me.out.total, me.back.total)));
            }
            if !fwd && !rev {
                return Poll::Pending;
            }
        }
    }
}
