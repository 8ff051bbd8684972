//! Wire tee.
//!
//! At the highest verbosity every byte read from and written to the
//! transport is mirrored to the tracing log. Bytes are never altered.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) struct WireLog<T> {
    inner: T,
    enabled: bool,
    conn_id: u64,
}

impl<T> WireLog<T> {
    pub(crate) fn new(inner: T, enabled: bool, conn_id: u64) -> Self {
        WireLog { inner, enabled, conn_id }
    }

    pub(crate) fn into_inner(self) -> T {
        self.inner
    }
}

fn log_bytes(conn_id: u64, dir: &'static str, data: &[u8]) {
    tracing::trace!(
        target: "courier_http::wire",
        conn = conn_id,
        dir = dir,
        len = data.len(),
        bytes = ?String::from_utf8_lossy(data),
    );
}

impl<T: AsyncRead + Unpin> AsyncRead for WireLog<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if this.enabled {
            if let Poll::Ready(Ok(())) = &poll {
                let data = &buf.filled()[before..];
                if !data.is_empty() {
                    log_bytes(this.conn_id, "recv", data);
                }
            }
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for WireLog<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if this.enabled {
            if let Poll::Ready(Ok(n)) = &poll {
                if *n > 0 {
                    log_bytes(this.conn_id, "send", &buf[..*n]);
                }
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
