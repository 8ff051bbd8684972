//! Keyed connection pool.
//!
//! Connections are shared by `(scheme, host, port)` origin. Acquisition
//! prefers a healthy idle connection, creates a new one within the
//! per-host and global limits, and otherwise queues in FIFO order until a
//! release frees a connection or a slot. The whole pool is guarded by one
//! mutex; waiting happens on per-waiter oneshot channels outside it.

pub mod connection;
pub(crate) mod tls;

pub use connection::{Origin, Scheme};
pub(crate) use connection::{ConnIo, Connection, Transaction};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::options::{PoolConfig, RequestOptions};

use tls::TlsContext;

/// Point-in-time pool occupancy, mainly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub total: usize,
}

pub(crate) struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    tls: TlsContext,
}

struct PoolState {
    idle: HashMap<Origin, VecDeque<Connection>>,
    busy: HashMap<Origin, usize>,
    total: usize,
    waiters: HashMap<Origin, VecDeque<oneshot::Sender<()>>>,
    next_id: u64,
    sweeper: Option<JoinHandle<()>>,
}

enum Step {
    Reused(Connection),
    Connect(u64),
    Wait(oneshot::Receiver<()>),
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(ConnectionPool {
            config,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                busy: HashMap::new(),
                total: 0,
                waiters: HashMap::new(),
                next_id: 1,
                sweeper: None,
            }),
            tls: TlsContext::new(),
        })
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        let idle = state.idle.values().map(|q| q.len()).sum();
        let busy = state.busy.values().sum();
        PoolStats { idle, busy, total: state.total }
    }

    /// Lease a connection for `origin`, within `opts.connect_timeout`.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        origin: &Origin,
        opts: &RequestOptions,
    ) -> Result<Transaction> {
        let deadline = tokio::time::Instant::now() + opts.connect_timeout;
        self.ensure_sweeper();

        loop {
            let step = {
                let mut state = self.state.lock().unwrap();
                if let Some(conn) = Self::take_idle(&mut state, origin, &self.config) {
                    *state.busy.entry(origin.clone()).or_insert(0) += 1;
                    Step::Reused(conn)
                } else if state.busy_for(origin) < self.config.connection_limit_per_host
                    && state.total < self.config.connection_limit
                {
                    *state.busy.entry(origin.clone()).or_insert(0) += 1;
                    state.total += 1;
                    let id = state.next_id;
                    state.next_id += 1;
                    Step::Connect(id)
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.entry(origin.clone()).or_default().push_back(tx);
                    Step::Wait(rx)
                }
            };

            match step {
                Step::Reused(conn) => {
                    metrics::counter!("courier_pool_connections_reused_total").increment(1);
                    tracing::debug!(conn = conn.id, origin = %origin, seq = conn.sequence, "pool: reusing idle connection");
                    return Ok(Transaction::new(conn, self.clone()));
                }
                Step::Connect(id) => match self.connect(origin, deadline, opts).await {
                    Ok(io) => {
                        metrics::counter!("courier_pool_connections_created_total").increment(1);
                        tracing::debug!(conn = id, origin = %origin, "pool: established connection");
                        let conn = Connection::new(id, origin.clone(), io);
                        return Ok(Transaction::new(conn, self.clone()));
                    }
                    Err(e) => {
                        let mut state = self.state.lock().unwrap();
                        state.dec_busy(origin);
                        state.total -= 1;
                        Self::wake_any(&mut state, origin);
                        return Err(e);
                    }
                },
                Step::Wait(rx) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(_) => continue,
                    Err(_elapsed) => {
                        // A release may have signalled us concurrently with
                        // the timeout; forward the wake so it is not lost.
                        let mut state = self.state.lock().unwrap();
                        Self::wake_any(&mut state, origin);
                        return Err(Error::ConnectTimeout(opts.connect_timeout));
                    }
                },
            }
        }
    }

    /// Return a leased connection. Reusable keep-alive connections go to
    /// the idle set; everything else closes.
    pub(crate) fn release(&self, mut conn: Connection, keep_alive: bool) {
        let origin = conn.origin.clone();
        let mut state = self.state.lock().unwrap();
        state.dec_busy(&origin);

        let reusable =
            keep_alive && !conn.broken && conn.sequence < self.config.max_requests;
        if reusable {
            conn.last_used = Instant::now();
            tracing::debug!(conn = conn.id, origin = %origin, seq = conn.sequence, "pool: parked idle connection");
            state.idle.entry(origin.clone()).or_default().push_back(conn);
            Self::wake_one(&mut state, &origin);
        } else {
            state.total -= 1;
            metrics::counter!("courier_pool_connections_closed_total").increment(1);
            tracing::debug!(conn = conn.id, origin = %origin, broken = conn.broken, "pool: closing connection");
            drop(conn);
            Self::wake_any(&mut state, &origin);
        }
    }

    /// Drop a leased connection that cannot be returned (errored or
    /// abandoned mid-exchange).
    pub(crate) fn discard(&self, conn: Connection) {
        let origin = conn.origin.clone();
        let mut state = self.state.lock().unwrap();
        state.dec_busy(&origin);
        state.total -= 1;
        metrics::counter!("courier_pool_connections_closed_total").increment(1);
        drop(conn);
        Self::wake_any(&mut state, &origin);
    }

    /// Close every idle connection. In-flight leases are unaffected; the
    /// pool remains usable. Intended for teardown in tests and managed
    /// shutdown.
    pub(crate) fn close_all(&self) {
        let mut state = self.state.lock().unwrap();
        let drained: usize = state.idle.values().map(|q| q.len()).sum();
        state.total -= drained;
        state.idle.clear();
        tracing::debug!(closed = drained, "pool: drained idle connections");
    }

    fn take_idle(
        state: &mut PoolState,
        origin: &Origin,
        config: &PoolConfig,
    ) -> Option<Connection> {
        let queue = state.idle.get_mut(origin)?;
        while let Some(conn) = queue.pop_front() {
            if conn.last_used.elapsed() >= config.idle_timeout {
                state.total -= 1;
                metrics::counter!("courier_pool_connections_evicted_total", "reason" => "idle")
                    .increment(1);
                continue;
            }
            if !conn.is_reusable() {
                state.total -= 1;
                metrics::counter!("courier_pool_connections_evicted_total", "reason" => "dead")
                    .increment(1);
                tracing::debug!(conn = conn.id, "pool: idle connection found dead on probe");
                continue;
            }
            return Some(conn);
        }
        None
    }

    async fn connect(
        &self,
        origin: &Origin,
        deadline: tokio::time::Instant,
        opts: &RequestOptions,
    ) -> Result<ConnIo> {
        let authority = origin.authority();
        let tcp = tokio::time::timeout_at(deadline, TcpStream::connect(&authority))
            .await
            .map_err(|_| Error::ConnectTimeout(opts.connect_timeout))?
            .map_err(Error::Connect)?;
        let _ = tcp.set_nodelay(true);

        if !origin.is_tls() {
            return Ok(ConnIo::Tcp(tcp));
        }

        let connector = self.tls.connector(opts.require_ssl_verification);
        let server_name = ServerName::try_from(origin.host.clone())
            .map_err(|_| Error::InvalidArgument(format!("invalid TLS server name {:?}", origin.host)))?;
        let tls = tokio::time::timeout_at(deadline, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::ConnectTimeout(opts.connect_timeout))?
            .map_err(Error::Connect)?;
        Ok(ConnIo::Tls(Box::new(tls)))
    }

    fn wake_one(state: &mut PoolState, origin: &Origin) -> bool {
        if let Some(queue) = state.waiters.get_mut(origin) {
            while let Some(tx) = queue.pop_front() {
                if tx.send(()).is_ok() {
                    return true;
                }
            }
        }
        false
    }

    /// Wake a waiter after a slot freed globally: same-origin waiters
    /// first, then anyone.
    fn wake_any(state: &mut PoolState, prefer: &Origin) {
        if Self::wake_one(state, prefer) {
            return;
        }
        let origins: Vec<Origin> = state.waiters.keys().cloned().collect();
        for origin in origins {
            if Self::wake_one(state, &origin) {
                return;
            }
        }
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.sweeper.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = (self.config.idle_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(5));
        state.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.sweep_idle();
            }
        }));
    }

    fn sweep_idle(&self) {
        let mut state = self.state.lock().unwrap();
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = 0;
        for queue in state.idle.values_mut() {
            let before = queue.len();
            queue.retain(|conn| conn.last_used.elapsed() < idle_timeout);
            evicted += before - queue.len();
        }
        state.idle.retain(|_, queue| !queue.is_empty());
        state.waiters.retain(|_, queue| !queue.is_empty());
        state.total -= evicted;
        if evicted > 0 {
            metrics::counter!("courier_pool_connections_evicted_total", "reason" => "idle")
                .increment(evicted as u64);
            tracing::debug!(evicted, "pool: swept idle connections");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().unwrap().sweeper.take() {
            handle.abort();
        }
    }
}

impl PoolState {
    fn busy_for(&self, origin: &Origin) -> usize {
        self.busy.get(origin).copied().unwrap_or(0)
    }

    fn dec_busy(&mut self, origin: &Origin) {
        if let Some(count) = self.busy.get_mut(origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.busy.remove(origin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts connections and keeps them open until the guard drops.
    async fn quiet_server() -> (Origin, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });
        let origin = Origin { scheme: Scheme::Http, host: "127.0.0.1".into(), port };
        (origin, handle)
    }

    fn opts_with_connect_timeout(ms: u64) -> RequestOptions {
        RequestOptions {
            connect_timeout: Duration::from_millis(ms),
            ..RequestOptions::default()
        }
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let opts = opts_with_connect_timeout(2000);

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        let first_id = tx.id();
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 1, total: 1 });
        tx.release(true);
        assert_eq!(pool.stats(), PoolStats { idle: 1, busy: 0, total: 1 });

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        assert_eq!(tx.id(), first_id);
        assert_eq!(tx.sequence(), 1);
        tx.release(true);
        server.abort();
    }

    #[tokio::test]
    async fn release_without_keep_alive_closes() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let opts = opts_with_connect_timeout(2000);

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        let first_id = tx.id();
        tx.release(false);
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 0, total: 0 });

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        assert_ne!(tx.id(), first_id);
        tx.release(true);
        server.abort();
    }

    #[tokio::test]
    async fn broken_connection_is_never_pooled() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let opts = opts_with_connect_timeout(2000);

        let mut tx = pool.acquire(&origin, &opts).await.unwrap();
        tx.mark_broken();
        tx.release(true);
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 0, total: 0 });
        server.abort();
    }

    #[tokio::test]
    async fn per_host_limit_queues_until_release() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig {
            connection_limit_per_host: 1,
            ..PoolConfig::default()
        });

        let tx = pool.acquire(&origin, &opts_with_connect_timeout(2000)).await.unwrap();
        let held_id = tx.id();

        let pool2 = pool.clone();
        let origin2 = origin.clone();
        let waiter = tokio::spawn(async move {
            pool2.acquire(&origin2, &opts_with_connect_timeout(2000)).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.release(true);
        let tx2 = waiter.await.unwrap().unwrap();
        assert_eq!(tx2.id(), held_id);
        tx2.release(true);
        server.abort();
    }

    #[tokio::test]
    async fn saturated_pool_times_out_with_connect_timeout() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig {
            connection_limit_per_host: 1,
            ..PoolConfig::default()
        });

        let _held = pool.acquire(&origin, &opts_with_connect_timeout(2000)).await.unwrap();
        let err = pool
            .acquire(&origin, &opts_with_connect_timeout(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout(_)));
        server.abort();
    }

    #[tokio::test]
    async fn half_closed_idle_connection_is_probed_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let origin = Origin { scheme: Scheme::Http, host: "127.0.0.1".into(), port };
        // Accept and immediately close every connection.
        let server = tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                drop(sock);
            }
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        let opts = opts_with_connect_timeout(2000);

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        let first_id = tx.id();
        tx.release(true);

        // Give the server time to close its side.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        assert_ne!(tx.id(), first_id, "dead idle connection must not be reused");
        tx.release(true);
        server.abort();
    }

    #[tokio::test]
    async fn connect_failure_reports_transport_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let origin = Origin { scheme: Scheme::Http, host: "127.0.0.1".into(), port };
        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool
            .acquire(&origin, &opts_with_connect_timeout(2000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 0, total: 0 });
    }

    #[tokio::test]
    async fn max_requests_retires_connection() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig { max_requests: 2, ..PoolConfig::default() });
        let opts = opts_with_connect_timeout(2000);

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        let first_id = tx.id();
        tx.release(true); // sequence 1
        let tx = pool.acquire(&origin, &opts).await.unwrap();
        assert_eq!(tx.id(), first_id);
        tx.release(true); // sequence 2 == max_requests: retire
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 0, total: 0 });
        server.abort();
    }

    #[tokio::test]
    async fn close_all_drains_idle() {
        let (origin, server) = quiet_server().await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let opts = opts_with_connect_timeout(2000);

        let tx = pool.acquire(&origin, &opts).await.unwrap();
        tx.release(true);
        assert_eq!(pool.stats().idle, 1);
        pool.close_all();
        assert_eq!(pool.stats(), PoolStats { idle: 0, busy: 0, total: 0 });
        server.abort();
    }
}
