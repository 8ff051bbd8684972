//! Basic authentication from URL userinfo.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use percent_encoding::percent_decode_str;

use crate::error::Result;
use crate::message::Response;

use super::{Exchange, Layer, Next};

pub struct BasicAuthLayer;

#[async_trait]
impl Layer for BasicAuthLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        let user = ex.url.username();
        if !user.is_empty() || ex.url.password().is_some() {
            if !ex.request.headers.contains("Authorization") {
                let user = percent_decode_str(user).decode_utf8_lossy().into_owned();
                let pass = percent_decode_str(ex.url.password().unwrap_or(""))
                    .decode_utf8_lossy()
                    .into_owned();
                let token = BASE64.encode(format!("{user}:{pass}"));
                ex.request.headers.set("Authorization", format!("Basic {token}"));
                tracing::debug!(user = user, "auth: injected basic credentials from URL");
            }
            // Userinfo must never appear on the wire.
            let _ = ex.url.set_username("");
            let _ = ex.url.set_password(None);
        }
        next.run(ex).await
    }
}
