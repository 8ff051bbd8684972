use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use url::Url;

use crate::error::{Error, Result};

use super::ConnectionPool;

/// Pool key: requests may share a connection only when all three parts
/// match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Origin {
    pub fn from_url(url: &Url) -> Result<Self> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::InvalidArgument(format!("unsupported scheme {other:?}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidArgument("URL has no host".into()))?
            .to_ascii_lowercase();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidArgument("URL has no port".into()))?;
        Ok(Origin { scheme, host, port })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `host:port` form used for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when `port` is the default for the scheme, in which case the
    /// `Host` header omits it.
    pub fn default_port(&self) -> bool {
        match self.scheme {
            Scheme::Http => self.port == 80,
            Scheme::Https => self.port == 443,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Plain or TLS transport under a connection.
pub(crate) enum ConnIo {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ConnIo {
    fn tcp(&self) -> &TcpStream {
        match self {
            ConnIo::Tcp(s) => s,
            ConnIo::Tls(s) => s.get_ref().0,
        }
    }
}

impl AsyncRead for ConnIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnIo::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ConnIo::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ConnIo::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ConnIo::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnIo::Tcp(s) => Pin::new(s).poll_flush(cx),
            ConnIo::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ConnIo::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ConnIo::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A long-lived transport binding owned by the pool.
///
/// At most one transaction uses a connection at a time; while idle it
/// sits in the pool's idle set until reused, swept, or found dead by the
/// acquire-time probe.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) origin: Origin,
    pub(crate) io: ConnIo,
    /// Exchanges served so far; bumped on every keep-alive release.
    pub(crate) sequence: u64,
    pub(crate) last_used: Instant,
    pub(crate) broken: bool,
}

impl Connection {
    pub(crate) fn new(id: u64, origin: Origin, io: ConnIo) -> Self {
        Connection {
            id,
            origin,
            io,
            sequence: 0,
            last_used: Instant::now(),
            broken: false,
        }
    }

    /// Non-blocking liveness probe for an idle connection. Any readable
    /// byte means the peer is out of sync; a clean read of zero means it
    /// half-closed. Only "would block" indicates a healthy idle socket.
    pub(crate) fn is_reusable(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.io.tcp().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("sequence", &self.sequence)
            .field("broken", &self.broken)
            .finish()
    }
}

/// A scoped lease on a [`Connection`] for exactly one exchange.
///
/// Behaves as a bidirectional byte stream. Explicit [`release`] decides
/// whether the connection returns to the idle set; dropping a transaction
/// without releasing it closes the connection.
///
/// [`release`]: Transaction::release
pub(crate) struct Transaction {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("conn", &self.conn)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(conn: Connection, pool: Arc<ConnectionPool>) -> Self {
        Transaction { conn: Some(conn), pool }
    }

    pub(crate) fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or(0)
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.conn.as_ref().map(|c| c.sequence).unwrap_or(0)
    }

    pub(crate) fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.broken = true;
        }
    }

    /// End the lease. With `keep_alive` the connection goes back to the
    /// idle set (pool limits and health permitting); otherwise it closes.
    pub(crate) fn release(mut self, keep_alive: bool) {
        if let Some(mut conn) = self.conn.take() {
            conn.sequence += 1;
            self.pool.release(conn, keep_alive);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(conn = conn.id, "pool: transaction dropped without release, closing");
            self.pool.discard(conn);
        }
    }
}

impl AsyncRead for Transaction {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.io).poll_read(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }
}

impl AsyncWrite for Transaction {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.io).poll_write(cx, buf),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.io).poll_flush(cx),
            None => Poll::Ready(Err(released())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(&mut conn.io).poll_shutdown(cx),
            None => Poll::Ready(Err(released())),
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transaction already released")
}
