use std::fmt;

use bytes::Bytes;
use tokio::io::AsyncRead;

/// Streaming request body source. Consumed once; cannot be replayed.
pub type BodySource = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// Request body.
///
/// `Bytes` bodies are cheaply cloneable and therefore replayable by the
/// retry and redirect layers. A `Stream` body is read once from its
/// source; after the wire layer consumes it the exchange carries the
/// `Streamed` sentinel and is no longer replayable.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream {
        reader: BodySource,
        /// Total length when known. Unknown length is sent with
        /// `Transfer-Encoding: chunked`.
        length: Option<u64>,
    },
    /// The body was already written to a connection.
    Streamed,
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, length: Option<u64>) -> Self {
        Body::Stream { reader: Box::new(reader), length }
    }

    /// Content length when determinable. `None` for unknown-length streams
    /// and for already-streamed bodies.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream { length, .. } => *length,
            Body::Streamed => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty) || matches!(self, Body::Bytes(b) if b.is_empty())
    }

    /// A second copy for replay, when the body permits it.
    pub fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(b) => Some(Body::Bytes(b.clone())),
            Body::Stream { .. } | Body::Streamed => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length={length:?})"),
            Body::Streamed => f.write_str("Body::Streamed"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Body {
    fn from(b: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(b))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

/// Response body as observed by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    /// Not yet received (or reset between retry attempts).
    #[default]
    None,
    /// Fully accumulated in memory.
    Buffered(Bytes),
    /// Copied into the caller-provided `response_stream` sink as it
    /// arrived; nothing is retained here.
    Streamed,
}

impl ResponseBody {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            ResponseBody::Buffered(b) => Some(b),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
