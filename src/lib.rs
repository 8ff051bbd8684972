//! courier-http: a client-side HTTP/1.1 request execution engine.
//!
//! Each request descends through a per-call stack of layers (redirect,
//! auth, cookies, retry, ...), acquires a pooled keep-alive connection,
//! and streams request and response bodies concurrently over it, so that
//! an early error response can cut a large upload short.
//!
//! ```no_run
//! use courier_http::{Body, Client, Headers, Method, RequestOptions};
//!
//! # async fn run() -> courier_http::Result<()> {
//! let client = Client::new();
//! let response = client
//!     .request(
//!         Method::GET,
//!         "http://example.com/",
//!         Headers::new(),
//!         Body::Empty,
//!         RequestOptions::default(),
//!     )
//!     .await?;
//! assert_eq!(response.status, 200);
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cookies;
pub mod error;
pub mod layers;
pub mod message;
pub mod options;
pub mod pool;
pub mod wire;

pub use client::{default_client, request, Client};
pub use cookies::CookieJar;
pub use error::{Error, Result};
pub use layers::aws4::Aws4Credentials;
pub use message::{Body, Headers, Request, Response, ResponseBody};
pub use options::{PoolConfig, RequestOptions, ResponseSink};
pub use pool::{Origin, PoolStats, Scheme};
pub use wire::RawStream;

pub use http::{Method, Version};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;
