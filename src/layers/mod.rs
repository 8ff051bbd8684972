//! The request pipeline.
//!
//! Each layer receives the descending exchange, may transform it, invokes
//! the rest of the stack through [`Next`], and may transform the
//! ascending response. The stack is assembled per call from the request
//! options in a fixed order (see [`crate::client`]); disabled layers are
//! simply not present.

pub mod aws4;
pub mod basic_auth;
pub mod canonical;
pub mod content_type;
pub mod cookies;
pub mod message;
pub mod redirect;
pub mod retry;
pub mod status;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use url::Url;

use crate::client::Terminal;
use crate::error::Result;
use crate::message::{Body, Request, Response};
use crate::options::RequestOptions;
use crate::wire::RawStream;

/// Callback driving a caller-managed exchange (see [`crate::Client::open`]).
pub(crate) type IoCallback =
    Box<dyn FnOnce(RawStream) -> BoxFuture<'static, Result<RawStream>> + Send + 'static>;

/// The state descending through the stack: the current target URL, the
/// typed request head, the body, and the per-call options.
pub struct Exchange {
    pub url: Url,
    pub request: Request,
    pub body: Body,
    pub opts: Arc<RequestOptions>,
    pub(crate) io_fn: Option<IoCallback>,
}

impl Exchange {
    pub(crate) fn new(url: Url, request: Request, body: Body, opts: Arc<RequestOptions>) -> Self {
        Exchange { url, request, body, opts, io_fn: None }
    }
}

/// One stage of the pipeline.
#[async_trait]
pub trait Layer: Send + Sync + 'static {
    async fn handle(&self, ex: Exchange, next: Next<'_>) -> Result<Response>;
}

/// Cursor over the remaining stack. Copyable so that layers such as
/// retry and redirect can run their tail more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pub(crate) layers: &'a [Arc<dyn Layer>],
    pub(crate) terminal: &'a Terminal,
}

impl Next<'_> {
    /// Run the remaining layers, ending in the transport dispatch.
    pub async fn run(self, ex: Exchange) -> Result<Response> {
        match self.layers.split_first() {
            Some((layer, rest)) => {
                layer.handle(ex, Next { layers: rest, terminal: self.terminal }).await
            }
            None => self.terminal.dispatch(ex).await,
        }
    }
}
