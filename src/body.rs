//! Read-side body framing.
//!
//! A response body ends in one of three ways: a `content-length` count
//! runs out, the chunked decoder sees the terminating chunk, or the peer
//! closes the connection. [`BodyReader`] captures that rule and stops
//! reading the transport exactly at the body boundary so the connection
//! can carry the next request.

use crate::chunked::ChunkedDecoder;
use crate::AsyncRead;
use crate::Error;
use futures_util::ready;
use http::HeaderMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

/// Raw read size while a chunk size line is still being parsed.
const CHUNK_PROBE_SIZE: usize = 1024;

/// Raw read size once a chunk size is known.
const CHUNK_READ_SIZE: usize = 16_384;

/// Serves bytes that were read past the response head before falling
/// through to the raw stream. The prefix is consumed monotonically and
/// never refilled.
pub(crate) struct PrefixRead<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixRead<S> {
    pub fn new(inner: S) -> Self {
        PrefixRead {
            inner,
            prefix: vec![],
            pos: 0,
        }
    }

    /// Install leftover bytes from head parsing. Only valid once the
    /// previous prefix is fully consumed.
    pub fn set_prefix(&mut self, prefix: Vec<u8>) {
        assert!(self.pos == self.prefix.len(), "set_prefix with bytes left");
        self.prefix = prefix;
        self.pos = 0;
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixRead<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let has = this.prefix.len() - this.pos;

        if has > 0 {
            let max = buf.len().min(has);
            buf[..max].copy_from_slice(&this.prefix[this.pos..this.pos + max]);
            this.pos += max;

            if this.pos == this.prefix.len() {
                // all replayed, drop the allocation.
                this.prefix = vec![];
                this.pos = 0;
            }

            return Ok(max).into();
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Limit reading data given configuration from response headers.
pub(crate) enum BodyReader {
    /// Chunked transfer-coding; the decoder knows where the body ends.
    Chunked(ChunkedRead),
    /// Body delimited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// Read until the peer closes (HTTP/1.0 style responses).
    ReadToEnd(ReadToEnd),
    /// No body expected.
    NoBody,
}

impl BodyReader {
    /// Select framing from response headers.
    ///
    /// 1. HEAD responses and 1xx/204/304 statuses have no body.
    /// 2. `transfer-encoding` with any value other than `identity` means
    ///    chunked, regardless of other headers.
    /// 3. `content-length: <n>` limits the read to n bytes.
    /// 4. Otherwise the body runs until the connection closes.
    pub fn from_headers(headers: &HeaderMap, is_head: bool, status: u16) -> Self {
        let no_body_status = status < 200 || status == 204 || status == 304;

        let ret = if is_head || no_body_status {
            BodyReader::NoBody
        } else if is_chunked(headers) {
            // https://tools.ietf.org/html/rfc7230#page-31
            // If a message is received with both a Transfer-Encoding and a
            // Content-Length header field, the Transfer-Encoding overrides the
            // Content-Length.
            BodyReader::Chunked(ChunkedRead::new())
        } else if let Some(size) = get_as::<u64>(headers, "content-length") {
            BodyReader::ContentLength(ContentLengthRead::new(size))
        } else {
            BodyReader::ReadToEnd(ReadToEnd::new())
        };

        trace!("BodyReader from headers: {:?}", ret);

        ret
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            BodyReader::ContentLength(r) => r.limit == 0,
            BodyReader::NoBody => true,
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            BodyReader::Chunked(v) => v.decoder.is_end(),
            BodyReader::ContentLength(v) => v.is_end(),
            BodyReader::ReadToEnd(v) => v.is_end(),
            BodyReader::NoBody => true,
        }
    }

    /// Whether the connection can carry another request once this body is
    /// done. Until-close framing consumes the connection by definition.
    pub fn is_reusable(&self) -> bool {
        let read_to_end = match self {
            BodyReader::ReadToEnd(_) => true,
            _ => false,
        };
        self.is_complete() && !read_to_end
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        match self {
            BodyReader::Chunked(v) => Some(v.decoder.trailers()),
            _ => None,
        }
    }

    /// Try read some body data.
    pub fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut S,
        buf: &mut [u8],
    ) -> Poll<Result<usize, Error>> {
        match self {
            BodyReader::Chunked(v) => v.poll_read(cx, recv, buf),
            BodyReader::ContentLength(v) => v.poll_read(cx, recv, buf),
            BodyReader::ReadToEnd(v) => v.poll_read(cx, recv, buf),
            BodyReader::NoBody => Ok(0).into(),
        }
    }

    /// Finish-reading step: consume whatever framing remains past the
    /// last body byte (the chunk trailer, or unread fixed-length bytes
    /// when a decoder stopped early) so the connection lands exactly at
    /// the next message boundary.
    pub fn poll_drain<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut S,
    ) -> Poll<Result<(), Error>> {
        let mut scratch = [0_u8; CHUNK_PROBE_SIZE];

        loop {
            if self.is_complete() {
                return Ok(()).into();
            }

            match self {
                BodyReader::Chunked(v) => {
                    match ready!(v.poll_read(cx, recv, &mut scratch[..])) {
                        Ok(_) => {}
                        // EOF mid-trailer is a framing violation, not a
                        // plain connection drop.
                        Err(Error::Closed(_)) => {
                            return Err(Error::Protocol(
                                "Stream ended before chunk trailer".into(),
                            ))
                            .into();
                        }
                        Err(e) => return Err(e).into(),
                    }
                }

                BodyReader::ContentLength(v) => {
                    ready!(v.poll_read(cx, recv, &mut scratch[..]))?;
                }

                // Not reusable anyway, nothing worth draining.
                BodyReader::ReadToEnd(_) | BodyReader::NoBody => return Ok(()).into(),
            }
        }
    }
}

/// Chunked framing over a raw stream, pumping the push-based decoder.
pub(crate) struct ChunkedRead {
    decoder: ChunkedDecoder,
    scratch: Vec<u8>,
}

impl ChunkedRead {
    fn new() -> Self {
        ChunkedRead {
            decoder: ChunkedDecoder::new(),
            scratch: vec![],
        }
    }

    fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut S,
        buf: &mut [u8],
    ) -> Poll<Result<usize, Error>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        loop {
            if self.decoder.data_available() {
                return Ok(self.decoder.read(buf)).into();
            }

            if self.decoder.is_end() {
                return Ok(0).into();
            }

            // Small probes while hunting for a size line, bigger reads
            // once we know body bytes are coming.
            let want = if self.decoder.size_known() {
                CHUNK_READ_SIZE
            } else {
                CHUNK_PROBE_SIZE
            };
            self.scratch.resize(want, 0);

            let amount =
                match ready!(Pin::new(&mut *recv).poll_read(cx, &mut self.scratch[..want])) {
                    Ok(v) => v,
                    Err(e) => return Err(Error::Receive(e)).into(),
                };

            if amount == 0 {
                trace!("Chunked body ended early");
                // past the zero chunk the only thing missing is trailer
                // framing, which makes a cut-off a violation rather than
                // a plain drop.
                if self.decoder.in_trailer() {
                    return Err(Error::Protocol("Stream ended before chunk trailer".into()))
                        .into();
                }
                return Err(Error::Closed("Partial body".into())).into();
            }

            self.decoder.write(&self.scratch[..amount])?;
        }
    }
}

/// Reader limited by a set length.
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn new(limit: u64) -> Self {
        ContentLengthRead { limit, total: 0 }
    }

    fn is_end(&self) -> bool {
        self.total == self.limit
    }

    fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut S,
        buf: &mut [u8],
    ) -> Poll<Result<usize, Error>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        let left = (self.limit - self.total).min(usize::max_value() as u64) as usize;

        if left == 0 {
            // Nothing more should be read.
            return Ok(0).into();
        }

        let max = buf.len().min(left);
        let amount = match ready!(Pin::new(&mut *recv).poll_read(cx, &mut buf[0..max])) {
            Ok(v) => v,
            Err(e) => return Err(Error::Receive(e)).into(),
        };

        if amount == 0 {
            // https://tools.ietf.org/html/rfc7230#page-32
            // If the sender closes the connection or the recipient
            // times out before the indicated number of octets are
            // received, the recipient MUST consider the message to be
            // incomplete and close the connection.
            let msg = format!(
                "Partial body received {} bytes and expected {}",
                self.total, self.limit
            );
            trace!("{}", msg);
            return Err(Error::Closed(msg)).into();
        }
        self.total += amount as u64;

        Ok(amount).into()
    }
}

pub(crate) struct ReadToEnd {
    reached_end: bool,
}

impl ReadToEnd {
    fn new() -> Self {
        ReadToEnd { reached_end: false }
    }

    fn is_end(&self) -> bool {
        self.reached_end
    }

    fn poll_read<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context,
        recv: &mut S,
        buf: &mut [u8],
    ) -> Poll<Result<usize, Error>> {
        assert!(!buf.is_empty(), "poll_read with len 0 buf");

        let amount = match ready!(Pin::new(&mut *recv).poll_read(cx, buf)) {
            Ok(v) => v,
            Err(e) => return Err(Error::Receive(e)).into(),
        };

        if amount == 0 {
            self.reached_end = true;
        }

        Ok(amount).into()
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodyReader::Chunked(_) => write!(f, "Chunked")?,
            BodyReader::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            BodyReader::ReadToEnd(_) => write!(f, "ReadToEnd")?,
            BodyReader::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

/// Whether the response headers allow keeping the connection.
///
/// HTTP/1.1 defaults to keep-alive unless `connection: close`; HTTP/1.0
/// requires an explicit `connection: keep-alive`.
pub(crate) fn allow_reuse(headers: &HeaderMap, version: http::Version) -> bool {
    if version == http::Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &HeaderMap, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            if h.eq_ignore_ascii_case("keep-alive") {
                Some(true)
            } else if h.eq_ignore_ascii_case("close") {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

pub(crate) fn get_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

pub(crate) fn get_as<T: FromStr>(headers: &HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.parse().ok())
}
