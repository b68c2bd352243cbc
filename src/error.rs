use std::fmt;
use std::io;

/// Possible errors from this crate.
///
/// Each variant is one failure classification, so a caller can decide
/// whether retrying on a fresh connection makes sense without parsing
/// message strings.
#[derive(Debug)]
pub enum Error {
    /// Address lookup failed inside the connector.
    Resolve(String),
    /// Transport-level connect failed.
    Connect(io::Error),
    /// Write on an established connection failed.
    Send(io::Error),
    /// Read on an established connection failed.
    Receive(io::Error),
    /// Malformed status line, headers or chunk framing. Always fatal to
    /// the connection carrying it.
    Protocol(String),
    /// Peer closed while more data was expected.
    Closed(String),
    /// The operation exceeded its deadline.
    Timeout,
    /// Explicit cancellation by the caller.
    Canceled,
    /// A user/usage problem such as sending more bytes than a content-length header specifies.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
}

impl Error {
    /// Whether this error means the connection must not go back to the pool.
    pub fn is_fatal_to_connection(&self) -> bool {
        match self {
            Error::User(_) | Error::Http(_) => false,
            _ => true,
        }
    }

    /// True for protocol violations (bad status line, headers or framing).
    pub fn is_protocol(&self) -> bool {
        match self {
            Error::Protocol(_) | Error::Http11Parser(_) => true,
            _ => false,
        }
    }

    /// True when the failure was a cancellation or deadline expiry.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Timeout | Error::Canceled => true,
            _ => false,
        }
    }

    /// Wrap into an `io::Error` without losing the classification. The
    /// original `Error` is recovered by `from_io` on the other side of an
    /// `AsyncRead` boundary.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Canceled => io::ErrorKind::Interrupted,
            Error::Closed(_) => io::ErrorKind::UnexpectedEof,
            Error::Protocol(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover a classified error smuggled through `into_io`, or wrap a
    /// plain transport error as `Io`.
    pub(crate) fn from_io(e: io::Error) -> Error {
        if e.get_ref().map(|i| i.is::<Error>()).unwrap_or(false) {
            let inner = e.into_inner().expect("io::Error with get_ref but no inner");
            return *inner.downcast::<Error>().expect("downcast checked by is::<Error>");
        }
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Resolve(v) => write!(f, "resolve: {}", v),
            Error::Connect(v) => write!(f, "connect: {}", v),
            Error::Send(v) => write!(f, "send: {}", v),
            Error::Receive(v) => write!(f, "receive: {}", v),
            Error::Protocol(v) => write!(f, "{}", v),
            Error::Closed(v) => write!(f, "{}", v),
            Error::Timeout => write!(f, "timeout"),
            Error::Canceled => write!(f, "canceled"),
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification_survives_io_round_trip() {
        let e = Error::Protocol("Missing CRLF after chunk".into());
        let io = e.into_io();
        assert_eq!(io.kind(), io::ErrorKind::InvalidData);

        let back = Error::from_io(io);
        assert!(back.is_protocol());
        assert_eq!(back.to_string(), "Missing CRLF after chunk");
    }

    #[test]
    fn plain_io_wraps_as_io() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        match Error::from_io(io) {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            e => panic!("wrong variant: {:?}", e),
        }
    }
}
