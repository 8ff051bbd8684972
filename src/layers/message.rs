//! The message layer: turns the raw `(url, headers, body)` triple into a
//! fully formed HTTP/1.1 request head.
//!
//! Everything below this layer can rely on `Host`, `User-Agent`,
//! `Accept` and body framing headers being present.

use async_trait::async_trait;
use http::Method;

use crate::error::Result;
use crate::message::Response;
use crate::pool::Origin;

use super::{Exchange, Layer, Next};

pub(crate) const USER_AGENT: &str = concat!("courier-http/", env!("CARGO_PKG_VERSION"));

pub struct MessageLayer;

#[async_trait]
impl Layer for MessageLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        ex.request.url = ex.url.clone();

        let origin = Origin::from_url(&ex.url)?;
        let host = if origin.default_port() {
            origin.host.clone()
        } else {
            origin.authority()
        };
        ex.request.headers.set_if_absent("Host", host);
        ex.request.headers.set_if_absent("User-Agent", USER_AGENT);
        ex.request.headers.set_if_absent("Accept", "*/*");

        let has_framing = ex.request.headers.contains("Content-Length")
            || ex.request.headers.token_list_contains("Transfer-Encoding", "chunked");
        if !has_framing {
            match ex.body.len() {
                Some(0) => {
                    if !bodyless_by_default(&ex.request.method) {
                        ex.request.headers.set("Content-Length", "0");
                    }
                }
                Some(n) => ex.request.headers.set("Content-Length", n.to_string()),
                // Unknown length streams are framed with chunked encoding.
                None => ex.request.headers.set("Transfer-Encoding", "chunked"),
            }
        }

        next.run(ex).await
    }
}

/// Methods whose empty body needs no `Content-Length: 0`.
fn bodyless_by_default(method: &Method) -> bool {
    matches!(method.as_str(), "GET" | "HEAD" | "DELETE" | "OPTIONS" | "TRACE" | "CONNECT")
}
