//! Cookie layer: attach matching cookies on the way down, learn
//! `Set-Cookie` on the way up. Runs per redirect hop (it sits below the
//! redirect layer), so each intermediate response feeds the jar too.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::message::{Headers, Response};

use super::{Exchange, Layer, Next};

pub struct CookieLayer {
    jar: Arc<CookieJar>,
}

impl CookieLayer {
    pub fn new(jar: Arc<CookieJar>) -> Self {
        CookieLayer { jar }
    }
}

#[async_trait]
impl Layer for CookieLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        if let Some(cookies) = self.jar.cookie_header(&ex.url) {
            let merged = match ex.request.headers.get("Cookie") {
                Some(existing) => format!("{existing}; {cookies}"),
                None => cookies,
            };
            ex.request.headers.set("Cookie", merged);
        }

        let url = ex.url.clone();
        match next.run(ex).await {
            Ok(response) => {
                self.learn(&url, &response.headers);
                Ok(response)
            }
            // Error statuses still carry Set-Cookie.
            Err(Error::Status { status, response }) => {
                self.learn(&url, &response.headers);
                Err(Error::Status { status, response })
            }
            Err(e) => Err(e),
        }
    }
}

impl CookieLayer {
    fn learn(&self, url: &Url, headers: &Headers) {
        for value in headers.get_all("Set-Cookie") {
            self.jar.learn(url, value);
        }
    }
}
