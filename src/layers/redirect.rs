//! Redirect layer: follows 3xx responses within a hop limit, re-running
//! the whole stack below it against the new target.
//!
//! 303 rewrites the method to GET and drops the body; 301/302/307/308
//! preserve both. Sensitive headers never cross an origin boundary.

use async_trait::async_trait;
use http::Method;

use crate::error::{Error, Result};
use crate::message::{Body, Headers, Request, Response};
use crate::pool::Origin;

use super::{Exchange, Layer, Next};

/// Headers stripped when a redirect leaves the original origin.
const SENSITIVE_HEADERS: &[&str] = &["Authorization", "Cookie", "Proxy-Authorization"];

pub struct RedirectLayer {
    limit: usize,
    forward_headers: bool,
}

impl RedirectLayer {
    pub fn new(limit: usize, forward_headers: bool) -> Self {
        RedirectLayer { limit, forward_headers }
    }
}

#[async_trait]
impl Layer for RedirectLayer {
    async fn handle(&self, ex: Exchange, next: Next<'_>) -> Result<Response> {
        let mut ex = ex;
        let mut hops = 0usize;

        loop {
            let saved_url = ex.url.clone();
            let saved_request = ex.request.clone();
            let saved_body = ex.body.try_clone();
            let saved_opts = ex.opts.clone();
            // A caller-driven exchange consumes its callback on the first
            // attempt and cannot be re-issued.
            let can_follow = ex.io_fn.is_none();

            let response = next.run(ex).await?;
            if !response.is_redirect() || !can_follow {
                return Ok(response);
            }
            let Some(location) = response.header("Location") else {
                return Ok(response);
            };
            if hops >= self.limit {
                metrics::counter!("courier_redirects_exceeded_total").increment(1);
                return Err(Error::TooManyRedirects(self.limit));
            }

            let target = saved_url.join(location).map_err(|e| {
                Error::Parse(format!("invalid Location {location:?}: {e}"))
            })?;

            // 303 means "fetch the result with GET"; other codes replay
            // the original method and body.
            let (method, body) = if response.status == 303 {
                (Method::GET, Some(Body::Empty))
            } else {
                (saved_request.method.clone(), saved_body)
            };
            let Some(body) = body else {
                tracing::debug!(
                    status = response.status,
                    "redirect: body already streamed, returning redirect response"
                );
                return Ok(response);
            };

            hops += 1;
            let cross_origin = Origin::from_url(&saved_url)? != Origin::from_url(&target)?;
            let mut headers = if self.forward_headers {
                saved_request.headers.clone()
            } else {
                Headers::new()
            };
            if cross_origin {
                for name in SENSITIVE_HEADERS {
                    headers.remove(name);
                }
            }
            // Recomputed by the message layer for the new target.
            headers.remove("Host");
            headers.remove("Content-Length");
            headers.remove("Transfer-Encoding");

            tracing::debug!(
                status = response.status,
                location = %target,
                hop = hops,
                cross_origin = cross_origin,
                "redirect: following"
            );
            metrics::counter!("courier_redirects_followed_total").increment(1);

            let mut request = Request::new(method, target.clone());
            request.version = saved_request.version;
            request.headers = headers;
            request.parent = Some(Box::new(saved_request));

            ex = Exchange::new(target, request, body, saved_opts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn relative_location_resolves_against_current_url() {
        let base = Url::parse("http://h/a/b").unwrap();
        assert_eq!(base.join("c").unwrap().as_str(), "http://h/a/c");
        assert_eq!(base.join("/root").unwrap().as_str(), "http://h/root");
        assert_eq!(base.join("http://other/x").unwrap().as_str(), "http://other/x");
    }

    #[test]
    fn sensitive_headers_are_stripped_cross_origin() {
        let mut headers = Headers::from_pairs([
            ("Authorization", "Bearer t"),
            ("Cookie", "sid=1"),
            ("X-Custom", "keep"),
        ]);
        for name in SENSITIVE_HEADERS {
            headers.remove(name);
        }
        assert!(!headers.contains("Authorization"));
        assert!(!headers.contains("Cookie"));
        assert_eq!(headers.get("X-Custom"), Some("keep"));
    }
}
