//! Content decoding layered over the framing readers.
//!
//! The decoder sits outermost: for a chunked gzip response the wrap order
//! is decoder over chunked framing over the raw connection stream. The
//! finish-reading step bypasses the decoder and drains the framing
//! directly, since the decompressor may produce its last output before
//! the chunk trailer has been consumed off the wire.

use crate::body::{get_str, BodyReader};
use crate::conn::Conn;
use crate::AsyncRead;
use crate::Error;
use futures_io::AsyncBufRead;
use futures_util::ready;
use http::HeaderMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Size of buffer reading response body into.
const READ_BUF_INIT_SIZE: usize = 16_384;

/// Content coding declared by the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Detect from `content-encoding`. Unknown codings pass through
    /// undecoded, leaving the header for the caller to act on.
    pub fn from_headers(headers: &HeaderMap) -> ContentCoding {
        let value = match get_str(headers, "content-encoding").map(str::trim) {
            Some(v) => v,
            None => return ContentCoding::Identity,
        };

        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            ContentCoding::Gzip
        } else if value.eq_ignore_ascii_case("deflate") {
            ContentCoding::Deflate
        } else {
            if !value.eq_ignore_ascii_case("identity") {
                debug!("Unknown content-encoding, passing through: {}", value);
            }
            ContentCoding::Identity
        }
    }
}

/// Owns the connection and its framing reader for the duration of one
/// response body, buffering so it can feed a decompressor via
/// `AsyncBufRead`.
pub(crate) struct BodyStream<S> {
    conn: Conn<S>,
    reader: BodyReader,
    buf: Vec<u8>,
    pos: usize,
    cap: usize,
}

impl<S> BodyStream<S> {
    pub fn new(conn: Conn<S>, reader: BodyReader) -> Self {
        BodyStream {
            conn,
            reader,
            buf: vec![0; READ_BUF_INIT_SIZE],
            pos: 0,
            cap: 0,
        }
    }

    pub fn into_parts(self) -> (Conn<S>, BodyReader) {
        (self.conn, self.reader)
    }
}

impl<S> BodyStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Consume framing past the last body byte so the connection lands on
    /// the next message boundary. Any decoded-but-unconsumed bytes left
    /// in the buffer are discarded first.
    pub fn poll_drain(&mut self, cx: &mut Context) -> Poll<Result<(), Error>> {
        self.pos = self.cap;
        self.reader.poll_drain(cx, self.conn.io_mut())
    }
}

impl<S> AsyncRead for BodyStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // First ship out buffered bytes.
        if this.pos < this.cap {
            let max = buf.len().min(this.cap - this.pos);
            buf[..max].copy_from_slice(&this.buf[this.pos..this.pos + max]);
            this.pos += max;
            return Ok(max).into();
        }

        match ready!(this.reader.poll_read(cx, this.conn.io_mut(), buf)) {
            Ok(v) => Ok(v).into(),
            Err(e) => Err(e.into_io()).into(),
        }
    }
}

impl<S> AsyncBufRead for BodyStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();

        if this.pos == this.cap {
            let amount =
                match ready!(this.reader.poll_read(cx, this.conn.io_mut(), &mut this.buf)) {
                    Ok(v) => v,
                    Err(e) => return Err(e.into_io()).into(),
                };
            this.pos = 0;
            this.cap = amount;
        }

        Ok(&this.buf[this.pos..this.cap]).into()
    }

    fn consume(self: Pin<&mut Self>, amount: usize) {
        let this = self.get_mut();

        let new_pos = this.pos + amount;

        // can't consume more than we have.
        assert!(new_pos <= this.cap);

        this.pos = new_pos;
    }
}
