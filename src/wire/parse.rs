//! Byte-level parsing seam.
//!
//! All wire parsing is delegated to `httparse`; this module adapts its
//! incremental interface to the reader loop: feed the accumulated buffer,
//! get back either "need more bytes" or a parsed head plus the number of
//! bytes consumed.

use http::Version;

use crate::error::{Error, Result};
use crate::message::Headers;

/// Upper bound on distinct header fields in a response head.
pub(crate) const MAX_HEADERS: usize = 128;

/// Upper bound on the size of the status line plus header block.
pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;

/// A parsed status line and header block.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: Headers,
}

impl ResponseHead {
    pub(crate) fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }
}

#[derive(Debug)]
pub(crate) enum HeadParse {
    /// More bytes are needed.
    Partial,
    Complete { consumed: usize, head: ResponseHead },
}

/// Parse a response head from the front of `buf`.
pub(crate) fn parse_head(buf: &[u8]) -> Result<HeadParse> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let version = match parsed.version {
                Some(0) => Version::HTTP_10,
                Some(1) => Version::HTTP_11,
                v => return Err(Error::Parse(format!("unsupported HTTP version {v:?}"))),
            };
            let status = parsed
                .code
                .ok_or_else(|| Error::Parse("missing status code".into()))?;
            let reason = parsed.reason.unwrap_or("").to_string();
            let headers = Headers::from_pairs(parsed.headers.iter().map(|h| {
                (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned())
            }));
            Ok(HeadParse::Complete {
                consumed,
                head: ResponseHead { status, reason, version, headers },
            })
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(Error::Parse("response head exceeds size limit".into()));
            }
            Ok(HeadParse::Partial)
        }
        Err(e) => Err(Error::Parse(format!("invalid response head: {e}"))),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkParse {
    Partial,
    /// `consumed` covers the size line including its CRLF.
    Complete { consumed: usize, size: u64 },
}

/// Parse a chunk-size line from the front of `buf`.
pub(crate) fn parse_chunk_size(buf: &[u8]) -> Result<ChunkParse> {
    match httparse::parse_chunk_size(buf) {
        Ok(httparse::Status::Complete((consumed, size))) => {
            Ok(ChunkParse::Complete { consumed, size })
        }
        Ok(httparse::Status::Partial) => Ok(ChunkParse::Partial),
        Err(_) => Err(Error::Parse("invalid chunk size line".into())),
    }
}
