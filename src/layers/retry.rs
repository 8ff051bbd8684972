//! Retry layer: re-issues the exchange on recoverable failures with
//! exponential backoff.
//!
//! A failure is recoverable when it is a transport error, or a status
//! error for 403, 408 or any 5xx. Replay additionally requires that the
//! request body can be cloned (a consumed stream cannot), that no
//! response byte has reached the caller's sink, and that the method is
//! idempotent unless `retry_non_idempotent` is set.

use std::time::Duration;

use async_trait::async_trait;
use http::Method;

use crate::error::{Error, Result};
use crate::message::Response;

use super::{Exchange, Layer, Next};

pub struct RetryLayer {
    retries: usize,
    retry_non_idempotent: bool,
    base_delay: Duration,
}

impl RetryLayer {
    pub fn new(retries: usize, retry_non_idempotent: bool, base_delay: Duration) -> Self {
        RetryLayer { retries, retry_non_idempotent, base_delay }
    }
}

/// Methods safe to repeat per RFC 7231 §4.2.2.
pub(crate) fn idempotent(method: &Method) -> bool {
    matches!(method.as_str(), "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS" | "TRACE")
}

/// Status codes worth another attempt.
pub(crate) fn retryable_status(status: u16) -> bool {
    status == 403 || status == 408 || status >= 500
}

/// Exponential backoff schedule: base, base*10, base*100, ...
pub(crate) struct Backoff {
    next_delay: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration) -> Self {
        Backoff { next_delay: base }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.next_delay;
        self.next_delay = delay.saturating_mul(10);
        Some(delay)
    }
}

#[async_trait]
impl Layer for RetryLayer {
    async fn handle(&self, ex: Exchange, next: Next<'_>) -> Result<Response> {
        let mut ex = ex;
        let mut backoff = Backoff::new(self.base_delay);
        let mut attempt = 0usize;

        loop {
            // Snapshot for replay before the attempt consumes the
            // exchange. `None` when this exchange cannot be replayed.
            let replay = if attempt < self.retries
                && ex.io_fn.is_none()
                && (self.retry_non_idempotent || idempotent(&ex.request.method))
            {
                ex.body
                    .try_clone()
                    .map(|body| (ex.url.clone(), ex.request.clone(), body, ex.opts.clone()))
            } else {
                None
            };

            match next.run(ex).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    let recoverable = err.is_transport()
                        || err.status().map(retryable_status).unwrap_or(false);
                    let Some((url, prev_request, body, opts)) = replay else {
                        return Err(err);
                    };
                    if !recoverable || attempt > self.retries {
                        return Err(err);
                    }
                    // A response partially delivered to the caller's sink
                    // cannot be un-delivered.
                    if opts
                        .response_stream
                        .as_ref()
                        .map(|sink| sink.touched())
                        .unwrap_or(false)
                    {
                        return Err(err);
                    }

                    let delay = backoff.next().unwrap_or(self.base_delay);
                    tracing::warn!(
                        attempt = attempt,
                        max = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retry: re-issuing request"
                    );
                    metrics::counter!(
                        "courier_retries_total",
                        "reason" => if err.is_transport() { "transport" } else { "status" },
                    )
                    .increment(1);

                    if let Some(cancel) = &opts.cancel {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(Error::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        tokio::time::sleep(delay).await;
                    }

                    let mut request = prev_request.clone();
                    request.parent = Some(Box::new(prev_request));
                    ex = Exchange::new(url, request, body, opts);
                }
            }
        }
    }
}
