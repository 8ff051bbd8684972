use std::time::Duration;

use crate::message::Response;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for a request execution.
///
/// Transport-level failures (`Connect`, `ConnectTimeout`, `Io`, `ReadTimeout`)
/// are candidates for the retry layer. `Parse`, `TooManyRedirects`,
/// `InvalidArgument` and `Cancelled` are fatal. `Status` carries the full
/// response and is retried only for a small set of status codes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS resolution, TCP connect or TLS handshake failed.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// The connect deadline elapsed before a connection (or a pool slot)
    /// became available.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Transport error on an established connection: reset, broken pipe,
    /// EOF before a complete response.
    #[error("transport error: {0}")]
    Io(#[source] std::io::Error),

    /// No response byte arrived within the configured read timeout.
    #[error("no data received within {0:?}")]
    ReadTimeout(Duration),

    /// The total-request deadline elapsed.
    #[error("request did not complete within {0:?}")]
    RequestTimeout(Duration),

    /// The peer sent bytes that do not parse as HTTP/1.x.
    #[error("malformed response: {0}")]
    Parse(String),

    /// The server answered with an error status and `status_exception`
    /// is enabled.
    #[error("request failed with status {status}")]
    Status { status: u16, response: Box<Response> },

    /// The redirect chain exceeded `redirect_limit`.
    #[error("redirect limit of {0} exceeded")]
    TooManyRedirects(usize),

    /// Invalid caller input, detected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller-provided cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// True for transport-level failures, the class the retry layer treats
    /// as recoverable regardless of status code.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::ConnectTimeout(_) | Error::Io(_) | Error::ReadTimeout(_)
        )
    }

    /// Status code carried by a `Status` error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Recover the response from a `Status` error, consuming the error.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Error::Status { response, .. } => Some(*response),
            _ => None,
        }
    }

    pub(crate) fn from_read_io(err: std::io::Error, read_timeout: Duration) -> Error {
        if err.kind() == std::io::ErrorKind::TimedOut && !read_timeout.is_zero() {
            Error::ReadTimeout(read_timeout)
        } else {
            Error::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst"));
        assert!(io.is_transport());
        assert!(Error::ConnectTimeout(Duration::from_secs(1)).is_transport());
        assert!(!Error::TooManyRedirects(3).is_transport());
        assert!(!Error::Cancelled.is_transport());
    }

    #[test]
    fn read_io_maps_timed_out_to_read_timeout() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "idle");
        let err = Error::from_read_io(timed_out, Duration::from_secs(1));
        assert!(matches!(err, Error::ReadTimeout(_)));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst");
        let err = Error::from_read_io(reset, Duration::from_secs(1));
        assert!(matches!(err, Error::Io(_)));
    }
}
