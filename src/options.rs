use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::cookies::CookieJar;
use crate::layers::aws4::Aws4Credentials;

/// Per-call options. Every field has a working default; construct with
/// struct-update syntax:
///
/// ```ignore
/// let opts = RequestOptions { retries: 2, ..RequestOptions::default() };
/// ```
pub struct RequestOptions {
    /// Follow 3xx responses.
    pub redirect: bool,
    /// Maximum number of redirect hops before `TooManyRedirects`.
    pub redirect_limit: usize,
    /// Forward caller headers to the redirect target. Sensitive headers
    /// are stripped on cross-origin hops regardless.
    pub forward_headers: bool,

    /// Inject `Authorization: Basic ...` from URL userinfo.
    pub basic_authorization: bool,
    /// Sign the request with AWS Signature V4.
    pub aws_authorization: bool,
    /// Credentials for SigV4. When absent, the process environment is
    /// consulted (`AWS_ACCESS_KEY_ID` et al).
    pub aws_credentials: Option<Aws4Credentials>,

    /// Attach cookies from a jar and learn `Set-Cookie` responses.
    pub cookies: bool,
    /// Jar override; the client's shared jar is used when `None`.
    pub cookie_jar: Option<Arc<CookieJar>>,

    /// Rewrite header names to canonical `Title-Case` on the way out and
    /// on the way back in.
    pub canonicalize_headers: bool,

    /// Re-issue the request on recoverable failures.
    pub retry: bool,
    /// Maximum retry attempts on top of the initial one. 0 disables retry.
    pub retries: usize,
    /// Permit retrying non-idempotent methods (POST, PATCH).
    pub retry_non_idempotent: bool,
    /// Base backoff delay; attempt n sleeps `retry_delay * 10^(n-1)`.
    pub retry_delay: Duration,

    /// Turn responses with status >= 400 into `Error::Status`.
    pub status_exception: bool,

    /// Idle read timeout; zero disables it. The deadline resets on every
    /// received byte.
    pub read_timeout: Duration,
    /// Deadline for acquiring a connection (DNS + TCP + TLS, or waiting
    /// on a pool slot).
    pub connect_timeout: Duration,
    /// How long to wait for `100 Continue` before sending the body when
    /// the request carries `Expect: 100-continue`.
    pub expect_timeout: Duration,
    /// Optional wall-clock bound on the whole call, all retries and
    /// redirects included.
    pub total_timeout: Option<Duration>,

    /// Sniff a content type from the body when none is set.
    pub detect_content_type: bool,

    /// When set, response body bytes are copied here as they arrive
    /// instead of being buffered on the response.
    pub response_stream: Option<ResponseSink>,

    /// 0 = quiet, 1 = request/response summary, 2 = + headers,
    /// 3 = + wire byte tee.
    pub verbose: u8,

    /// Verify TLS certificates. Disabling accepts any certificate.
    pub require_ssl_verification: bool,

    /// Cooperative cancellation; aborts the exchange and discards the
    /// connection when fired.
    pub cancel: Option<CancellationToken>,
}

fn default_redirect_limit() -> usize {
    3
}

fn default_retries() -> usize {
    4
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_expect_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            redirect: true,
            redirect_limit: default_redirect_limit(),
            forward_headers: false,
            basic_authorization: false,
            aws_authorization: false,
            aws_credentials: None,
            cookies: false,
            cookie_jar: None,
            canonicalize_headers: false,
            retry: true,
            retries: default_retries(),
            retry_non_idempotent: false,
            retry_delay: default_retry_delay(),
            status_exception: true,
            read_timeout: Duration::ZERO,
            connect_timeout: default_connect_timeout(),
            expect_timeout: default_expect_timeout(),
            total_timeout: None,
            detect_content_type: false,
            response_stream: None,
            verbose: 0,
            require_ssl_verification: true,
            cancel: None,
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("redirect", &self.redirect)
            .field("redirect_limit", &self.redirect_limit)
            .field("retry", &self.retry)
            .field("retries", &self.retries)
            .field("status_exception", &self.status_exception)
            .field("read_timeout", &self.read_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("verbose", &self.verbose)
            .field("response_stream", &self.response_stream.is_some())
            .finish_non_exhaustive()
    }
}

/// Caller-provided sink for streaming response bodies.
///
/// Once any byte has been written the exchange is no longer replayable,
/// which the retry layer checks via [`ResponseSink::touched`].
pub struct ResponseSink {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin + 'static>>,
    touched: AtomicBool,
}

impl ResponseSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        ResponseSink {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            touched: AtomicBool::new(false),
        }
    }

    /// True once any response byte reached the sink.
    pub fn touched(&self) -> bool {
        self.touched.load(Ordering::Acquire)
    }

    pub(crate) async fn write(&self, chunk: &[u8]) -> std::io::Result<()> {
        self.touched.store(true, Ordering::Release);
        let mut w = self.writer.lock().await;
        w.write_all(chunk).await?;
        w.flush().await
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseSink {{ touched: {} }}", self.touched())
    }
}

/// Connection pool sizing and lifetime bounds, shared by every request
/// issued through one [`crate::Client`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on connections across all origins.
    pub connection_limit: usize,
    /// Upper bound on connections per (scheme, host, port).
    pub connection_limit_per_host: usize,
    /// Idle connections older than this are closed by the sweeper and
    /// refused on acquire.
    pub idle_timeout: Duration,
    /// A connection is closed after serving this many exchanges.
    pub max_requests: u64,
}

fn default_connection_limit() -> usize {
    64
}

fn default_connection_limit_per_host() -> usize {
    8
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_requests() -> u64 {
    1000
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connection_limit: default_connection_limit(),
            connection_limit_per_host: default_connection_limit_per_host(),
            idle_timeout: default_idle_timeout(),
            max_requests: default_max_requests(),
        }
    }
}
