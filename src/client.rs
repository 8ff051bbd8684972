//! The caller-facing client: per-call stack assembly, the terminal
//! transport dispatch, and the process-wide default client.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use http::Method;
use once_cell::sync::Lazy;
use url::Url;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::layers::aws4::{Aws4AuthLayer, Aws4Credentials};
use crate::layers::basic_auth::BasicAuthLayer;
use crate::layers::canonical::CanonicalizeLayer;
use crate::layers::content_type::ContentTypeLayer;
use crate::layers::cookies::CookieLayer;
use crate::layers::message::MessageLayer;
use crate::layers::redirect::RedirectLayer;
use crate::layers::retry::RetryLayer;
use crate::layers::status::StatusLayer;
use crate::layers::{Exchange, IoCallback, Layer, Next};
use crate::message::{Body, Headers, Request, Response};
use crate::options::{PoolConfig, RequestOptions};
use crate::pool::{ConnectionPool, Origin, PoolStats};
use crate::wire::{self, RawStream, WrappedIo};

/// An HTTP/1.1 client: a connection pool, a shared cookie jar, and the
/// machinery to run the per-call layer stack.
///
/// Cloning is intentionally absent; share a client with `Arc` or use the
/// process-wide [`default_client`].
pub struct Client {
    pool: Arc<ConnectionPool>,
    jar: Arc<CookieJar>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Client {
            pool: ConnectionPool::new(config),
            jar: Arc::new(CookieJar::new()),
        }
    }

    /// The jar used when `cookies: true` without an explicit override.
    pub fn cookie_jar(&self) -> Arc<CookieJar> {
        self.jar.clone()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close all idle pooled connections. In-flight requests finish
    /// normally; intended for teardown.
    pub fn close_all(&self) {
        self.pool.close_all();
    }

    /// Execute one request through the configured layer stack.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: Headers,
        body: Body,
        opts: RequestOptions,
    ) -> Result<Response> {
        let url = parse_url(url)?;
        let opts = Arc::new(opts);
        let started = Instant::now();

        let fut = self.run(method.clone(), url.clone(), headers, body, opts.clone(), None);
        let result = match opts.total_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::RequestTimeout(limit)),
            },
            None => fut.await,
        };

        log_outcome(&method, &url, &result, started, opts.verbose);
        result
    }

    /// Like [`request`], but hands the raw stream to `io_fn` instead of
    /// running the internal reader/writer tasks: the callback writes the
    /// request body and may consume the response body itself. The upper
    /// layers (redirect, auth, cookies, retry, ...) still apply, though
    /// such an exchange is never replayed.
    ///
    /// [`request`]: Client::request
    pub async fn open<F, Fut>(
        &self,
        method: Method,
        url: &str,
        headers: Headers,
        opts: RequestOptions,
        io_fn: F,
    ) -> Result<Response>
    where
        F: FnOnce(RawStream) -> Fut + Send + 'static,
        Fut: Future<Output = Result<RawStream>> + Send + 'static,
    {
        let url = parse_url(url)?;
        let opts = Arc::new(opts);
        let started = Instant::now();
        let callback: IoCallback = Box::new(move |raw| io_fn(raw).boxed());

        let result = self
            .run(method.clone(), url.clone(), headers, Body::Empty, opts.clone(), Some(callback))
            .await;
        log_outcome(&method, &url, &result, started, opts.verbose);
        result
    }

    async fn run(
        &self,
        method: Method,
        url: Url,
        headers: Headers,
        body: Body,
        opts: Arc<RequestOptions>,
        io_fn: Option<IoCallback>,
    ) -> Result<Response> {
        let stack = self.build_stack(&opts)?;
        let terminal = Terminal { pool: self.pool.clone() };

        let mut request = Request::new(method, url.clone());
        request.headers = headers;
        let mut ex = Exchange::new(url, request, body, opts);
        ex.io_fn = io_fn;

        Next { layers: &stack, terminal: &terminal }.run(ex).await
    }

    /// Assemble the stack for this call, in fixed order, skipping
    /// disabled layers entirely.
    fn build_stack(&self, opts: &Arc<RequestOptions>) -> Result<Vec<Arc<dyn Layer>>> {
        let mut stack: Vec<Arc<dyn Layer>> = Vec::with_capacity(8);

        if opts.redirect {
            stack.push(Arc::new(RedirectLayer::new(opts.redirect_limit, opts.forward_headers)));
        }
        if opts.basic_authorization {
            stack.push(Arc::new(BasicAuthLayer));
        }
        if opts.detect_content_type {
            stack.push(Arc::new(ContentTypeLayer));
        }
        if opts.cookies {
            let jar = opts.cookie_jar.clone().unwrap_or_else(|| self.jar.clone());
            stack.push(Arc::new(CookieLayer::new(jar)));
        }
        if opts.canonicalize_headers {
            stack.push(Arc::new(CanonicalizeLayer));
        }
        stack.push(Arc::new(MessageLayer));
        if opts.aws_authorization {
            let creds = opts
                .aws_credentials
                .clone()
                .or_else(Aws4Credentials::from_env)
                .ok_or_else(|| {
                    Error::InvalidArgument(
                        "aws_authorization enabled but no credentials available".into(),
                    )
                })?;
            stack.push(Arc::new(Aws4AuthLayer::new(creds)));
        }
        if opts.retry && opts.retries > 0 {
            stack.push(Arc::new(RetryLayer::new(
                opts.retries,
                opts.retry_non_idempotent,
                opts.retry_delay,
            )));
        }
        if opts.status_exception {
            stack.push(Arc::new(StatusLayer));
        }

        Ok(stack)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let parsed =
        Url::parse(url).map_err(|e| Error::InvalidArgument(format!("invalid URL {url:?}: {e}")))?;
    // Fail before any I/O on schemes the transport cannot serve.
    Origin::from_url(&parsed)?;
    Ok(parsed)
}

fn log_outcome(
    method: &Method,
    url: &Url,
    result: &Result<Response>,
    started: Instant,
    verbose: u8,
) {
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(response) => {
            if verbose >= 1 {
                tracing::info!(
                    method = %method,
                    url = %url,
                    status = response.status,
                    latency_ms = latency_ms,
                    "request"
                );
            } else {
                tracing::debug!(method = %method, url = %url, status = response.status, latency_ms = latency_ms, "request");
            }
            if verbose >= 2 {
                for (name, value) in response.headers.iter() {
                    tracing::info!(target: "courier_http::headers", "{name}: {value}");
                }
            }
        }
        Err(err) => {
            if verbose >= 1 {
                tracing::warn!(method = %method, url = %url, error = %err, latency_ms = latency_ms, "request failed");
            } else {
                tracing::debug!(method = %method, url = %url, error = %err, latency_ms = latency_ms, "request failed");
            }
        }
    }
}

/// The bottom of the stack: acquire a pooled transaction, wrap it with
/// the timeout and wire-tee layers, drive the exchange, release.
pub(crate) struct Terminal {
    pool: Arc<ConnectionPool>,
}

impl Terminal {
    pub(crate) async fn dispatch(&self, mut ex: Exchange) -> Result<Response> {
        let origin = Origin::from_url(&ex.url)?;
        let tx = self.pool.acquire(&origin, &ex.opts).await?;
        let conn_id = tx.id();
        let sequence = tx.sequence();
        let wrapped = wire::wrap_transaction(tx, ex.opts.read_timeout, ex.opts.verbose);

        if let Some(io_fn) = ex.io_fn.take() {
            return self.dispatch_raw(wrapped, ex, io_fn).await;
        }

        let body = std::mem::take(&mut ex.body);
        let (result, io_back) = wire::stream::execute(wrapped, &ex.request, body, &ex.opts).await;
        match result {
            Ok(outcome) => {
                tracing::debug!(
                    conn = conn_id,
                    seq = sequence,
                    status = outcome.response.status,
                    reuse = outcome.reuse,
                    "dispatch: exchange complete"
                );
                if let Some(io) = io_back {
                    wire::unwrap_transaction(io).release(outcome.reuse);
                }
                let mut response = outcome.response;
                response.request = Some(Box::new(ex.request));
                Ok(response)
            }
            Err(err) => {
                if let Some(io) = io_back {
                    let mut tx = wire::unwrap_transaction(io);
                    tx.mark_broken();
                    tx.release(false);
                }
                Err(err)
            }
        }
    }

    async fn dispatch_raw(
        &self,
        wrapped: WrappedIo,
        ex: Exchange,
        io_fn: IoCallback,
    ) -> Result<Response> {
        let raw = RawStream::new(wrapped, &ex.request, ex.opts.clone());
        // An erring callback drops the stream, and with it the
        // transaction; the pool reclaims the slot on that drop.
        let raw = io_fn(raw).await?;
        let (result, io, reuse) = raw.finish().await;
        let mut tx = wire::unwrap_transaction(io);
        match result {
            Ok(mut response) => {
                tx.release(reuse);
                response.request = Some(Box::new(ex.request));
                Ok(response)
            }
            Err(err) => {
                tx.mark_broken();
                tx.release(false);
                Err(err)
            }
        }
    }
}

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// The process-wide client behind the free [`request`] function.
pub fn default_client() -> &'static Client {
    &DEFAULT_CLIENT
}

/// Execute a request on the process-wide default client.
pub async fn request(
    method: Method,
    url: &str,
    headers: Headers,
    body: Body,
    opts: RequestOptions,
) -> Result<Response> {
    DEFAULT_CLIENT.request(method, url, headers, body, opts).await
}
