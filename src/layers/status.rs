//! Status exception layer: error statuses become `Error::Status` so the
//! retry layer above can classify them and callers do not silently read
//! error bodies as success.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::message::Response;

use super::{Exchange, Layer, Next};

pub struct StatusLayer;

#[async_trait]
impl Layer for StatusLayer {
    async fn handle(&self, ex: Exchange, next: Next<'_>) -> Result<Response> {
        let response = next.run(ex).await?;
        if response.status >= 400 {
            return Err(Error::Status {
                status: response.status,
                response: Box::new(response),
            });
        }
        Ok(response)
    }
}
