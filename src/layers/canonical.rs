//! Header canonicalization: `content-type` → `Content-Type`, applied to
//! the outgoing request and to the response on its way back up.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::Response;

use super::{Exchange, Layer, Next};

pub struct CanonicalizeLayer;

#[async_trait]
impl Layer for CanonicalizeLayer {
    async fn handle(&self, mut ex: Exchange, next: Next<'_>) -> Result<Response> {
        ex.request.headers.canonicalize();
        match next.run(ex).await {
            Ok(mut response) => {
                response.headers.canonicalize();
                Ok(response)
            }
            Err(Error::Status { status, mut response }) => {
                response.headers.canonicalize();
                Err(Error::Status { status, response })
            }
            Err(e) => Err(e),
        }
    }
}
