//! The wire state machine: drives one request/response exchange over an
//! exclusive transport.
//!
//! Upload and download overlap: the request head is flushed first, then a
//! spawned writer task streams the body while the calling task parses the
//! response. A server may therefore reject a large upload with an early
//! final response (RFC 7230 §6.5) without the exchange deadlocking.

use std::io;

use bytes::BytesMut;
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::{Body, Request, Response, ResponseBody};
use crate::options::RequestOptions;

use super::parse::{self, ChunkParse, HeadParse, ResponseHead};

const READ_BUF_INIT: usize = 8 * 1024;
const STREAM_CHUNK: usize = 16 * 1024;

/// Outcome of a completed exchange: the response plus the verdict on
/// whether the connection may go back to the idle pool.
#[derive(Debug)]
pub(crate) struct ExchangeResult {
    pub response: Response,
    pub reuse: bool,
}

/// How the response body is delimited. Fixed once the head is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Run one exchange over `io`. Returns the result together with the
/// transport, so the caller can hand the connection back to the pool.
/// The transport is `None` when a cancelled or failed writer task made
/// the halves unrecoverable; dropping them closes the connection.
pub(crate) async fn execute<T>(
    io: T,
    request: &Request,
    body: Body,
    opts: &RequestOptions,
) -> (Result<ExchangeResult>, Option<T>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cancel = opts.cancel.clone().unwrap_or_default();
    let chunked = request.headers.token_list_contains("Transfer-Encoding", "chunked");
    let expect_continue = request
        .headers
        .get("Expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);

    let (mut rd, mut wr) = tokio::io::split(io);
    let mut rbuf = BytesMut::with_capacity(READ_BUF_INIT);

    // Request line and headers go out before anything else; the body may
    // be held back below for Expect: 100-continue.
    let head_bytes = serialize_head(request);
    if let Err(e) = write_all_flush(&mut wr, &head_bytes, &cancel).await {
        return (Err(classify_write_error(e, &cancel)), Some(rd.unsplit(wr)));
    }

    let mut early_head: Option<ResponseHead> = None;
    if expect_continue && !matches!(body, Body::Empty) {
        match await_continue(&mut rd, &mut rbuf, opts, &cancel).await {
            Ok(ContinueSignal::Proceed) => {}
            Ok(ContinueSignal::Final(head)) => early_head = Some(head),
            Err(e) => return (Err(e), Some(rd.unsplit(wr))),
        }
    }

    // Writer task streams the body concurrently with response parsing.
    // When the server already answered with a final status during the
    // Expect wait, the body is never sent and the connection cannot be
    // reused (its framing no longer matches the request head).
    let early_skip = early_head.is_some();
    let mut writer: Option<JoinHandle<(io::Result<()>, WriteHalf<T>)>> = None;
    let mut wr_slot: Option<WriteHalf<T>> = None;
    if early_skip {
        wr_slot = Some(wr);
    } else {
        let cancel_w = cancel.clone();
        writer = Some(tokio::spawn(async move {
            let result = write_body_stream(&mut wr, body, chunked, &cancel_w).await;
            (result, wr)
        }));
        // Make sure the head is on the wire ahead of the reader parsing.
        tokio::task::yield_now().await;
    }

    let read_result: Result<(ResponseHead, ResponseBody, bool, BodyFraming)> = async {
        let head = match early_head {
            Some(head) => head,
            None => read_final_head(&mut rd, &mut rbuf, opts, &cancel).await?,
        };
        let framing = response_framing(&request.method, &head)?;
        let (resp_body, clean) = read_body(&mut rd, &mut rbuf, framing, opts, &cancel).await?;
        // Bytes past the framed body mean the peer is out of sync; the
        // connection cannot be trusted for another exchange.
        Ok((head, resp_body, clean && rbuf.is_empty(), framing))
    }
    .await;

    let (write_result, wr_back) = match writer {
        Some(handle) => {
            if read_result.is_err() {
                // The exchange already failed; a writer blocked against a
                // stalled peer must not keep us here.
                handle.abort();
                match handle.await {
                    Ok((result, wr)) => (result, Some(wr)),
                    Err(_) => (Ok(()), None),
                }
            } else {
                match handle.await {
                    Ok((result, wr)) => (result, Some(wr)),
                    Err(join_err) => (
                        Err(io::Error::other(format!("writer task failed: {join_err}"))),
                        None,
                    ),
                }
            }
        }
        None => (Ok(()), wr_slot),
    };

    let io_back = wr_back.map(|wr| rd.unsplit(wr));

    let result = match read_result {
        Err(e) => Err(e),
        Ok((head, resp_body, clean, framing)) => {
            finish_exchange(head, resp_body, clean, framing, write_result, early_skip)
        }
    };
    (result, io_back)
}

fn finish_exchange(
    head: ResponseHead,
    resp_body: ResponseBody,
    clean: bool,
    framing: BodyFraming,
    write_result: io::Result<()>,
    early_skip: bool,
) -> Result<ExchangeResult> {
    let write_ok = match write_result {
        Ok(()) => true,
        Err(e) => {
            // The server closed its read side mid-upload. The response
            // stands when it is final and non-2xx (RFC 7230 §6.5); the
            // connection is not reusable either way.
            if head.status >= 300 {
                tracing::debug!(
                    status = head.status,
                    error = %e,
                    "stream: early final response wins over writer error"
                );
                false
            } else {
                return Err(Error::Io(e));
            }
        }
    };

    let reuse = clean
        && write_ok
        && !early_skip
        && framing != BodyFraming::UntilClose
        && keep_alive_negotiated(&head);

    let response = Response {
        status: head.status,
        reason: head.reason,
        version: head.version,
        headers: head.headers,
        body: resp_body,
        request: None,
    };
    Ok(ExchangeResult { response, reuse })
}

/// Keep-alive is the HTTP/1.1 default and opt-in for HTTP/1.0.
pub(crate) fn keep_alive_negotiated(head: &ResponseHead) -> bool {
    if head.version == Version::HTTP_11 {
        !head.headers.token_list_contains("Connection", "close")
    } else if head.version == Version::HTTP_10 {
        head.headers.token_list_contains("Connection", "keep-alive")
    } else {
        false
    }
}

/// Serialize the request line and header block.
pub(crate) fn serialize_head(request: &Request) -> Vec<u8> {
    let version = if request.version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target().as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in request.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Decide the response body delimitation per RFC 7230 §3.3.3.
pub(crate) fn response_framing(method: &Method, head: &ResponseHead) -> Result<BodyFraming> {
    if *method == Method::HEAD || head.status == 204 || head.status == 304 || head.is_informational()
    {
        return Ok(BodyFraming::None);
    }
    if head.headers.token_list_contains("Transfer-Encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    if head.headers.contains("Content-Length") {
        let mut length: Option<u64> = None;
        for value in head.headers.get_all("Content-Length") {
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Parse(format!("invalid Content-Length {value:?}")))?;
            match length {
                Some(prev) if prev != parsed => {
                    return Err(Error::Parse("conflicting Content-Length values".into()));
                }
                _ => length = Some(parsed),
            }
        }
        let length = length.unwrap_or(0);
        return Ok(if length == 0 { BodyFraming::None } else { BodyFraming::Length(length) });
    }
    Ok(BodyFraming::UntilClose)
}

enum ContinueSignal {
    Proceed,
    Final(ResponseHead),
}

/// Wait up to `expect_timeout` for the interim `100 Continue`. Silence
/// means "send the body anyway"; a final status means "skip the body".
async fn await_continue<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<ContinueSignal> {
    match tokio::time::timeout(opts.expect_timeout, read_head(rd, rbuf, opts, cancel)).await {
        Err(_elapsed) => Ok(ContinueSignal::Proceed),
        Ok(Ok(head)) if head.is_informational() => Ok(ContinueSignal::Proceed),
        Ok(Ok(head)) => Ok(ContinueSignal::Final(head)),
        Ok(Err(e)) => Err(e),
    }
}

/// Read one head. The caller decides what to do with interim responses.
async fn read_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<ResponseHead> {
    loop {
        match parse::parse_head(rbuf)? {
            HeadParse::Complete { consumed, head } => {
                let _ = rbuf.split_to(consumed);
                return Ok(head);
            }
            HeadParse::Partial => {
                let n = read_some(rd, rbuf, opts, cancel).await?;
                if n == 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before a complete response head",
                    )));
                }
            }
        }
    }
}

/// Read heads until a non-interim one arrives.
pub(crate) async fn read_final_head<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<ResponseHead> {
    loop {
        let head = read_head(rd, rbuf, opts, cancel).await?;
        if !head.is_informational() {
            return Ok(head);
        }
        if head.status == 101 {
            return Err(Error::Parse("unexpected 101 Switching Protocols".into()));
        }
        tracing::debug!(status = head.status, "stream: skipping interim response");
    }
}

struct BodyOut<'a> {
    opts: &'a RequestOptions,
    buf: BytesMut,
}

impl BodyOut<'_> {
    async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        match &self.opts.response_stream {
            Some(sink) => sink.write(chunk).await.map_err(Error::Io),
            None => {
                self.buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    fn finish(self) -> ResponseBody {
        if self.opts.response_stream.is_some() {
            ResponseBody::Streamed
        } else {
            ResponseBody::Buffered(self.buf.freeze())
        }
    }
}

/// Read the response body per `framing`. Returns the body representation
/// and whether the framing completed cleanly (until-close framing is
/// clean at EOF but the connection is spent regardless).
async fn read_body<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    framing: BodyFraming,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<(ResponseBody, bool)> {
    let mut out = BodyOut { opts, buf: BytesMut::new() };
    let mut reader = BodyReader::new(framing);
    while let Some(chunk) = reader.next_chunk(rd, rbuf, opts, cancel).await? {
        out.push(&chunk).await?;
    }
    Ok((out.finish(), true))
}

/// Incremental response-body decoder shared by the concurrent exchange
/// and the caller-driven raw stream. Tracks position within the framing;
/// `next_chunk` yields decoded payload until the body is complete.
pub(crate) struct BodyReader {
    framing: BodyFraming,
    /// `Length`: bytes left in the body. `Chunked`: bytes left in the
    /// current chunk.
    remaining: u64,
    in_chunk: bool,
    done: bool,
}

impl BodyReader {
    pub(crate) fn new(framing: BodyFraming) -> Self {
        let remaining = match framing {
            BodyFraming::Length(n) => n,
            _ => 0,
        };
        BodyReader {
            framing,
            remaining,
            in_chunk: false,
            done: matches!(framing, BodyFraming::None | BodyFraming::Length(0)),
        }
    }

    pub(crate) async fn next_chunk<R: AsyncRead + Unpin>(
        &mut self,
        rd: &mut R,
        rbuf: &mut BytesMut,
        opts: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<bytes::Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            BodyFraming::None => {
                self.done = true;
                Ok(None)
            }
            BodyFraming::Length(_) => {
                if rbuf.is_empty() {
                    require_bytes(rd, rbuf, opts, cancel).await?;
                }
                let take = rbuf.len().min(self.remaining as usize);
                let chunk = rbuf.split_to(take).freeze();
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(Some(chunk))
            }
            BodyFraming::Chunked => self.next_chunked(rd, rbuf, opts, cancel).await,
            BodyFraming::UntilClose => {
                if !rbuf.is_empty() {
                    return Ok(Some(rbuf.split_to(rbuf.len()).freeze()));
                }
                let n = read_some(rd, rbuf, opts, cancel).await?;
                if n == 0 {
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(rbuf.split_to(rbuf.len()).freeze()))
            }
        }
    }

    async fn next_chunked<R: AsyncRead + Unpin>(
        &mut self,
        rd: &mut R,
        rbuf: &mut BytesMut,
        opts: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<bytes::Bytes>> {
        loop {
            if self.in_chunk && self.remaining == 0 {
                // CRLF terminating the chunk data.
                while rbuf.len() < 2 {
                    require_bytes(rd, rbuf, opts, cancel).await?;
                }
                if &rbuf[..2] != b"\r\n" {
                    return Err(Error::Parse("missing CRLF after chunk data".into()));
                }
                let _ = rbuf.split_to(2);
                self.in_chunk = false;
            }

            if !self.in_chunk {
                let size = loop {
                    match parse::parse_chunk_size(rbuf)? {
                        ChunkParse::Complete { consumed, size } => {
                            let _ = rbuf.split_to(consumed);
                            break size;
                        }
                        ChunkParse::Partial => {
                            require_bytes(rd, rbuf, opts, cancel).await?;
                        }
                    }
                };
                if size == 0 {
                    // Trailer section: zero or more header lines, then CRLF.
                    loop {
                        match find_crlf(rbuf) {
                            Some(0) => {
                                let _ = rbuf.split_to(2);
                                self.done = true;
                                return Ok(None);
                            }
                            Some(line_len) => {
                                let _ = rbuf.split_to(line_len + 2);
                            }
                            None => {
                                require_bytes(rd, rbuf, opts, cancel).await?;
                            }
                        }
                    }
                }
                self.remaining = size;
                self.in_chunk = true;
            }

            if rbuf.is_empty() {
                require_bytes(rd, rbuf, opts, cancel).await?;
            }
            let take = rbuf.len().min(self.remaining as usize);
            if take > 0 {
                let chunk = rbuf.split_to(take).freeze();
                self.remaining -= take as u64;
                return Ok(Some(chunk));
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn require_bytes<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let n = read_some(rd, rbuf, opts, cancel).await?;
    if n == 0 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-body",
        )));
    }
    Ok(())
}

pub(crate) async fn read_some<R: AsyncRead + Unpin>(
    rd: &mut R,
    rbuf: &mut BytesMut,
    opts: &RequestOptions,
    cancel: &CancellationToken,
) -> Result<usize> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = rd.read_buf(rbuf) => r.map_err(|e| Error::from_read_io(e, opts.read_timeout)),
    }
}

pub(crate) async fn write_all_flush<W: AsyncWrite + Unpin>(
    wr: &mut W,
    data: &[u8],
    cancel: &CancellationToken,
) -> io::Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")),
        r = async {
            wr.write_all(data).await?;
            wr.flush().await
        } => r,
    }
}

pub(crate) fn classify_write_error(e: io::Error, cancel: &CancellationToken) -> Error {
    if e.kind() == io::ErrorKind::Interrupted && cancel.is_cancelled() {
        Error::Cancelled
    } else {
        Error::Io(e)
    }
}

/// Body writer, run on its own task. Emits chunked framing when the
/// request negotiated `Transfer-Encoding: chunked`.
async fn write_body_stream<W: AsyncWrite + Unpin>(
    wr: &mut W,
    body: Body,
    chunked: bool,
    cancel: &CancellationToken,
) -> io::Result<()> {
    match body {
        Body::Empty | Body::Streamed => Ok(()),
        Body::Bytes(bytes) => {
            if chunked {
                if !bytes.is_empty() {
                    write_chunk(wr, &bytes).await?;
                }
                wr.write_all(b"0\r\n\r\n").await?;
            } else {
                wr.write_all(&bytes).await?;
            }
            wr.flush().await
        }
        Body::Stream { mut reader, .. } => {
            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                let n = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
                    }
                    r = reader.read(&mut buf) => r?,
                };
                if n == 0 {
                    break;
                }
                if chunked {
                    write_chunk(wr, &buf[..n]).await?;
                } else {
                    wr.write_all(&buf[..n]).await?;
                }
            }
            if chunked {
                wr.write_all(b"0\r\n\r\n").await?;
            }
            wr.flush().await
        }
    }
}

pub(crate) async fn write_chunk<W: AsyncWrite + Unpin>(wr: &mut W, data: &[u8]) -> io::Result<()> {
    wr.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    wr.write_all(data).await?;
    wr.write_all(b"\r\n").await
}
