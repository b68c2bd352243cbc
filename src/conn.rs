//! One physical connection to one endpoint.

use crate::body::{allow_reuse, is_chunked, PrefixRead};
use crate::cancel::Cancel;
use crate::chunked::ChunkedEncoder;
use crate::client::Body;
use crate::http11::{poll_read_head, try_parse_response, write_request};
use crate::pool::EndpointKey;
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use futures_util::future::poll_fn;
use futures_util::ready;
use std::fmt;
use std::pin::Pin;
use std::time::Instant;

/// A connection carrying strictly sequential request/response exchanges.
///
/// While checked out of the pool it is owned by exactly one in-flight
/// request; `reusable` decides whether release pools it again or closes
/// it.
pub struct Conn<S> {
    io: PrefixRead<S>,
    key: EndpointKey,
    version: http::Version,
    reusable: bool,
    /// Request asked for `connection: close`; overrides whatever the
    /// response says.
    req_close: bool,
    created: Instant,
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, key: EndpointKey) -> Self {
        Conn {
            io: PrefixRead::new(stream),
            key,
            version: http::Version::HTTP_11,
            reusable: false,
            req_close: false,
            created: Instant::now(),
        }
    }

    /// Serialize the request head and body onto the wire.
    ///
    /// The body is chunk-encoded when the request head declares
    /// `transfer-encoding: chunked`, otherwise written as is.
    pub(crate) async fn send_request(
        &mut self,
        req: &http::Request<()>,
        body: &Body,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        self.req_close = wants_close(req.headers());

        let mut to_write = vec![];
        write_request(req, &mut to_write)?;

        let data = body.as_bytes();
        if !data.is_empty() {
            if is_chunked(req.headers()) {
                ChunkedEncoder::write_chunk(data, &mut to_write)?;
                ChunkedEncoder::write_finish(&mut to_write)?;
            } else {
                to_write.extend_from_slice(data);
            }
        } else if is_chunked(req.headers()) {
            // an empty chunked body is still a terminated body.
            ChunkedEncoder::write_finish(&mut to_write)?;
        }

        let io = self.io.inner_mut();
        let mut pos = 0;
        let mut flushed = false;

        poll_fn(|cx| {
            cancel.check(cx)?;

            while pos < to_write.len() {
                let amount =
                    match ready!(Pin::new(&mut *io).poll_write(cx, &to_write[pos..])) {
                        Ok(v) => v,
                        Err(e) => return Err(Error::Send(e)).into(),
                    };
                trace!("send_request wrote: {}", amount);
                pos += amount;
            }

            if !flushed {
                if let Err(e) = ready!(Pin::new(&mut *io).poll_flush(cx)) {
                    return Err(Error::Send(e)).into();
                }
                flushed = true;
            }

            Ok(()).into()
        })
        .await
    }

    /// Read and parse the response head. Bytes read past the head go into
    /// the prefix buffer for the body stream to replay.
    pub(crate) async fn read_response(
        &mut self,
        cancel: &Cancel,
    ) -> Result<http::Response<()>, Error> {
        let mut buf = vec![];
        let mut scanned = 0;

        let io = &mut self.io;
        let end = poll_fn(|cx| {
            cancel.check(cx)?;
            poll_read_head(cx, io, &mut buf, &mut scanned)
        })
        .await?;

        let (res, used) = try_parse_response(&buf[..end])?;

        // invariant: the parser must use the exact head we scanned out.
        assert_eq!(used, end);

        let leftover = buf.split_off(end);
        if !leftover.is_empty() {
            trace!("read_response leftover: {}", leftover.len());
            self.io.set_prefix(leftover);
        }

        self.version = res.version();
        self.reusable = allow_reuse(res.headers(), res.version()) && !self.req_close;

        Ok(res)
    }
}

impl<S> Conn<S> {
    pub(crate) fn io_mut(&mut self) -> &mut PrefixRead<S> {
        &mut self.io
    }

    pub(crate) fn key(&self) -> &EndpointKey {
        &self.key
    }

    /// Negotiated protocol version of the last exchange.
    pub fn version(&self) -> http::Version {
        self.version
    }

    /// Whether release may put this connection back in the idle set.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Poison the connection so release closes it.
    pub(crate) fn mark_not_reusable(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }
}

fn wants_close(headers: &http::HeaderMap) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

impl<S> fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conn({} reusable: {})",
            self.key, self.reusable
        )
    }
}
