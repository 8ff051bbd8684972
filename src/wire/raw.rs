//! Caller-driven exchange for [`crate::Client::open`].
//!
//! The concurrent reader/writer tasks of the normal path are suppressed;
//! the caller sequences writes and reads itself through this handle. The
//! write side moves idle → headers → body → closed, the read side idle →
//! head → body → closed, and a body can never be read before the status
//! line and headers have been parsed.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{Headers, Request, Response, ResponseBody};
use crate::options::RequestOptions;

use super::parse::ResponseHead;
use super::stream::{self, BodyFraming, BodyReader};
use super::WrappedIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Idle,
    Headers,
    Body,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Idle,
    Body,
    Closed,
}

/// Raw access to one in-flight exchange.
///
/// Obtained through [`crate::Client::open`]; the callback drives the
/// request body and may consume the response body chunk by chunk. Any
/// body bytes the callback leaves unread are drained afterwards and, when
/// the callback read none at all, buffered onto the returned response.
pub struct RawStream {
    io: WrappedIo,
    opts: Arc<RequestOptions>,
    cancel: CancellationToken,
    method: Method,
    head_bytes: Vec<u8>,
    chunked: bool,
    rbuf: BytesMut,
    write_phase: WritePhase,
    read_phase: ReadPhase,
    head: Option<ResponseHead>,
    framing: Option<BodyFraming>,
    body_reader: Option<BodyReader>,
    consumed_by_caller: bool,
    write_failed: bool,
}

impl RawStream {
    pub(crate) fn new(io: WrappedIo, request: &Request, opts: Arc<RequestOptions>) -> Self {
        let cancel = opts.cancel.clone().unwrap_or_default();
        RawStream {
            head_bytes: stream::serialize_head(request),
            chunked: request.headers.token_list_contains("Transfer-Encoding", "chunked"),
            method: request.method.clone(),
            io,
            opts,
            cancel,
            rbuf: BytesMut::with_capacity(8 * 1024),
            write_phase: WritePhase::Idle,
            read_phase: ReadPhase::Idle,
            head: None,
            framing: None,
            body_reader: None,
            consumed_by_caller: false,
            write_failed: false,
        }
    }

    /// Flush the request line and headers. Idempotent; implied by the
    /// first body write or read.
    pub async fn send_headers(&mut self) -> Result<()> {
        if self.write_phase != WritePhase::Idle {
            return Ok(());
        }
        stream::write_all_flush(&mut self.io, &self.head_bytes, &self.cancel)
            .await
            .map_err(|e| stream::classify_write_error(e, &self.cancel))?;
        self.write_phase = WritePhase::Headers;
        Ok(())
    }

    /// Write one piece of the request body, applying chunked framing when
    /// the request negotiated it.
    pub async fn write_body(&mut self, chunk: &[u8]) -> Result<()> {
        if self.write_phase == WritePhase::Closed {
            return Err(Error::InvalidArgument("request body already finished".into()));
        }
        self.send_headers().await?;
        self.write_phase = WritePhase::Body;
        if chunk.is_empty() {
            return Ok(());
        }
        let result = if self.chunked {
            stream::write_chunk(&mut self.io, chunk).await
        } else {
            self.io.write_all(chunk).await
        };
        result.map_err(|e| {
            self.write_failed = true;
            stream::classify_write_error(e, &self.cancel)
        })
    }

    /// Half-close the request: terminal chunk (when chunked) plus flush.
    pub async fn finish_body(&mut self) -> Result<()> {
        if self.write_phase == WritePhase::Closed {
            return Ok(());
        }
        self.send_headers().await?;
        let result = async {
            if self.chunked {
                self.io.write_all(b"0\r\n\r\n").await?;
            }
            self.io.flush().await
        }
        .await;
        result.map_err(|e| {
            self.write_failed = true;
            stream::classify_write_error(e, &self.cancel)
        })?;
        self.write_phase = WritePhase::Closed;
        Ok(())
    }

    /// Parse the status line and headers, finishing the request body
    /// first if the caller has not. Idempotent.
    pub async fn read_response(&mut self) -> Result<()> {
        if self.read_phase != ReadPhase::Idle {
            return Ok(());
        }
        self.finish_body().await?;
        let head =
            stream::read_final_head(&mut self.io, &mut self.rbuf, self.opts.as_ref(), &self.cancel)
                .await?;
        let framing = stream::response_framing(&self.method, &head)?;
        self.body_reader = Some(BodyReader::new(framing));
        self.framing = Some(framing);
        self.head = Some(head);
        self.read_phase = ReadPhase::Body;
        Ok(())
    }

    /// Status code, once [`read_response`] has run.
    ///
    /// [`read_response`]: RawStream::read_response
    pub fn status(&self) -> Option<u16> {
        self.head.as_ref().map(|h| h.status)
    }

    /// Response headers, once [`read_response`] has run.
    ///
    /// [`read_response`]: RawStream::read_response
    pub fn response_headers(&self) -> Option<&Headers> {
        self.head.as_ref().map(|h| &h.headers)
    }

    /// Next piece of the response body; `None` once the body is complete.
    /// Implies [`read_response`].
    ///
    /// [`read_response`]: RawStream::read_response
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        self.read_response().await?;
        let Some(reader) = self.body_reader.as_mut() else {
            return Ok(None);
        };
        let chunk = reader
            .next_chunk(&mut self.io, &mut self.rbuf, self.opts.as_ref(), &self.cancel)
            .await?;
        match &chunk {
            Some(_) => self.consumed_by_caller = true,
            None => self.read_phase = ReadPhase::Closed,
        }
        Ok(chunk)
    }

    /// Complete whatever the callback left unfinished and settle the
    /// exchange. Returns the response, the transport for pool release,
    /// and the keep-alive verdict.
    pub(crate) async fn finish(mut self) -> (Result<Response>, WrappedIo, bool) {
        if let Err(e) = self.read_response().await {
            return (Err(e), self.io, false);
        }

        // Whether the *callback* touched the body decides the final body
        // representation; the drain below must not count.
        let touched = self.consumed_by_caller;
        let mut drained = BytesMut::new();
        loop {
            match self.read_body_chunk().await {
                Ok(Some(chunk)) => drained.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return (Err(e), self.io, false),
            }
        }

        let Some(head) = self.head.take() else {
            return (Err(Error::Parse("response head missing".into())), self.io, false);
        };

        let reuse = !self.write_failed
            && self.rbuf.is_empty()
            && self.framing != Some(BodyFraming::UntilClose)
            && stream::keep_alive_negotiated(&head);

        let body = if touched {
            ResponseBody::Streamed
        } else {
            ResponseBody::Buffered(drained.freeze())
        };

        let response = Response {
            status: head.status,
            reason: head.reason,
            version: head.version,
            headers: head.headers,
            body,
            request: None,
        };
        (Ok(response), self.io, reuse)
    }
}
