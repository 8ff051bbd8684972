//! Typed request/response messages and their header and body
//! representations.

pub mod body;
pub mod headers;

pub use body::{Body, BodySource, ResponseBody};
pub use headers::Headers;

use http::{Method, Version};
use url::Url;

/// An outgoing HTTP/1.x request head.
///
/// The body travels separately through the pipeline so that it can be
/// moved into the wire writer task while the head stays available for
/// logging, retry replay and redirect history.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub version: Version,
    pub headers: Headers,
    /// The request this one supersedes, when it was produced by a
    /// redirect hop or a retry attempt. The chain records the full
    /// history of the exchange.
    pub parent: Option<Box<Request>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            version: Version::HTTP_11,
            headers: Headers::new(),
            parent: None,
        }
    }

    /// origin-form request target: path plus optional query.
    pub fn target(&self) -> String {
        let path = self.url.path();
        let path = if path.is_empty() { "/" } else { path };
        match self.url.query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        }
    }

    /// Number of requests in the parent chain, including this one.
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self;
        while let Some(p) = &cur.parent {
            n += 1;
            cur = p;
        }
        n
    }
}

/// A received HTTP/1.x response.
///
/// `status` is the raw status code; 0 means "not yet populated" (a fresh
/// response slot, or one reset between retry attempts).
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: Headers,
    pub body: ResponseBody,
    /// The request that produced this response, with its redirect/retry
    /// history in `parent`.
    pub request: Option<Box<Request>>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    /// First value of `name`, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Buffered body decoded as lossy UTF-8. Empty for streamed bodies.
    pub fn text(&self) -> String {
        match self.body.bytes() {
            Some(b) => String::from_utf8_lossy(b).into_owned(),
            None => String::new(),
        }
    }

    /// Clear everything received so far. Used between retry attempts.
    pub fn reset(&mut self) {
        self.status = 0;
        self.reason.clear();
        self.headers.clear();
        self.body = ResponseBody::None;
    }
}
