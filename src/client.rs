//! Client surface: logical requests in, responses with readable body
//! streams out.

use crate::body::{get_as, is_chunked, BodyReader};
use crate::cancel::Cancel;
use crate::decode::{BodyStream, ContentCoding};
use crate::pool::{Connect, EndpointKey, Pool, PoolConfig};
use crate::AsyncRead;
use crate::Error;
use async_compression::futures::bufread::{GzipDecoder, ZlibDecoder};
use futures_util::future::poll_fn;
use futures_util::ready;
use http::HeaderMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Request body.
#[derive(Debug, Clone)]
pub enum Body {
    /// No body.
    Empty,
    /// Complete body bytes. Written with a `content-length` header unless
    /// the request declares `transfer-encoding: chunked`, in which case it
    /// is chunk-encoded onto the wire.
    Full(Vec<u8>),
}

impl Body {
    /// Returns true if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// The body as a byte slice, empty slice if no body.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Full(v) => v,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Body::Empty
        } else {
            Body::Full(v)
        }
    }
}

impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        Body::from(v.to_vec())
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::from(v.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::from(v.into_bytes())
    }
}

/// HTTP/1.1 client over a pooled [`Connect`] transport.
///
/// Cheap to clone; clones share the pool.
pub struct Client<C: Connect> {
    pool: Arc<Pool<C>>,
    group: String,
}

impl<C: Connect> Clone for Client<C> {
    fn clone(&self) -> Self {
        Client {
            pool: self.pool.clone(),
            group: self.group.clone(),
        }
    }
}

impl<C: Connect> Client<C> {
    /// Client with default pool configuration.
    pub fn new(connector: C) -> Self {
        Client::with_config(connector, PoolConfig::default())
    }

    /// Client with explicit pool configuration.
    pub fn with_config(connector: C, config: PoolConfig) -> Self {
        Client {
            pool: Arc::new(Pool::new(connector, config)),
            group: String::new(),
        }
    }

    /// Use a named connection group. Requests sent through this client
    /// never share connections with other groups, even for the same host.
    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.into();
        self
    }

    /// The underlying pool, for inspection and idle purging.
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Send a request and read the response head.
    ///
    /// Resolves once status and headers are in; the body is read from the
    /// returned stream. The connection goes back to the pool when the body
    /// stream reaches its end (trailer included); dropping the stream
    /// early, cancelling, or any transport/framing error closes the
    /// connection instead.
    pub async fn send(
        &self,
        req: http::Request<Body>,
        cancel: &Cancel,
    ) -> Result<http::Response<RecvBody<C>>, Error> {
        let (mut parts, body) = req.into_parts();

        let key = EndpointKey::from_uri(&parts.uri, &self.group)?;

        prepare_headers(&mut parts.headers, &body)?;

        let req = http::Request::from_parts(parts, ());
        let is_head = req.method() == http::Method::HEAD;

        let mut conn = self.pool.acquire(&key, cancel).await?;

        if let Err(e) = conn.send_request(&req, &body, cancel).await {
            self.pool.discard(conn);
            return Err(e);
        }

        let res = match conn.read_response(cancel).await {
            Ok(v) => v,
            Err(e) => {
                self.pool.discard(conn);
                return Err(e);
            }
        };

        let (rparts, ()) = res.into_parts();

        let reader = BodyReader::from_headers(&rparts.headers, is_head, rparts.status.as_u16());

        if reader.is_no_body() {
            // framing already complete, the connection is free now.
            self.pool.release(conn);
            let body = RecvBody::empty(self.pool.clone(), cancel.clone());
            return Ok(http::Response::from_parts(rparts, body));
        }

        let stream = BodyStream::new(conn, reader);

        // decoder outermost, framing innermost.
        let state = match ContentCoding::from_headers(&rparts.headers) {
            ContentCoding::Identity => BodyKind::Plain(stream),
            ContentCoding::Gzip => BodyKind::Gzip(GzipDecoder::new(stream)),
            ContentCoding::Deflate => BodyKind::Deflate(ZlibDecoder::new(stream)),
        };

        let body = RecvBody {
            state: Some(state),
            pool: self.pool.clone(),
            cancel: cancel.clone(),
            finishing: false,
            done: false,
            trailers: None,
        };

        Ok(http::Response::from_parts(rparts, body))
    }
}

/// Reconcile the body with the request's framing headers: validate an
/// explicit `content-length` against the actual size and add the header
/// when it is missing (unless the body goes out chunked).
fn prepare_headers(headers: &mut HeaderMap, body: &Body) -> Result<(), Error> {
    if is_chunked(headers) {
        return Ok(());
    }

    let len = body.as_bytes().len() as u64;

    if let Some(declared) = get_as::<u64>(headers, "content-length") {
        if len > declared {
            return Err(Error::User(format!(
                "Body data longer than content-length header: {} > {}",
                len, declared
            )));
        }
        if len < declared {
            return Err(Error::User(format!(
                "Body data shorter than content-length header: {} < {}",
                len, declared
            )));
        }
    } else if len > 0 {
        let value = len.to_string().parse().expect("u64 is a valid header value");
        headers.insert("content-length", value);
    }

    Ok(())
}

enum BodyKind<S> {
    Plain(BodyStream<S>),
    Gzip(GzipDecoder<BodyStream<S>>),
    Deflate(ZlibDecoder<BodyStream<S>>),
}

impl<S: AsyncRead + Unpin> BodyKind<S> {
    fn stream_mut(&mut self) -> &mut BodyStream<S> {
        match self {
            BodyKind::Plain(s) => s,
            BodyKind::Gzip(d) => d.get_mut(),
            BodyKind::Deflate(d) => d.get_mut(),
        }
    }

    fn into_stream(self) -> BodyStream<S> {
        match self {
            BodyKind::Plain(s) => s,
            BodyKind::Gzip(d) => d.into_inner(),
            BodyKind::Deflate(d) => d.into_inner(),
        }
    }
}

/// Receives a response body from the remote peer.
///
/// Reading 0 means the body logically ended; by then any chunk trailer
/// has been drained and the connection returned to the pool. Dropping
/// before the end closes the connection rather than pooling it in an
/// unknown mid-read state.
pub struct RecvBody<C: Connect> {
    state: Option<BodyKind<C::Stream>>,
    pool: Arc<Pool<C>>,
    cancel: Cancel,
    finishing: bool,
    done: bool,
    trailers: Option<HeaderMap>,
}

impl<C: Connect> RecvBody<C> {
    fn empty(pool: Arc<Pool<C>>, cancel: Cancel) -> Self {
        RecvBody {
            state: None,
            pool,
            cancel,
            finishing: false,
            done: true,
            trailers: None,
        }
    }

    /// Read some body data in an async way.
    pub fn poll_read(&mut self, cx: &mut Context, buf: &mut [u8]) -> Poll<Result<usize, Error>> {
        if self.done {
            return Ok(0).into();
        }

        if let Err(e) = self.cancel.check(cx) {
            self.abort();
            return Err(e).into();
        }

        if !self.finishing {
            let state = self.state.as_mut().expect("RecvBody without state");

            let poll = match state {
                BodyKind::Plain(s) => Pin::new(s).poll_read(cx, buf),
                BodyKind::Gzip(d) => Pin::new(d).poll_read(cx, buf),
                BodyKind::Deflate(d) => Pin::new(d).poll_read(cx, buf),
            };

            match ready!(poll) {
                Ok(0) => {
                    // logical end; drain the framing tail before
                    // surfacing the 0.
                    self.finishing = true;
                }
                Ok(amount) => return Ok(amount).into(),
                Err(e) => {
                    let e = Error::from_io(e);
                    self.abort();
                    return Err(e).into();
                }
            }
        }

        let state = self.state.as_mut().expect("RecvBody without state");

        if let Err(e) = ready!(state.stream_mut().poll_drain(cx)) {
            self.abort();
            return Err(e).into();
        }

        let stream = self.state.take().expect("RecvBody without state");
        let (mut conn, reader) = stream.into_stream().into_parts();

        self.trailers = reader.trailers().cloned();

        if !reader.is_reusable() {
            conn.mark_not_reusable();
        }

        self.pool.release(conn);
        self.done = true;

        Ok(0).into()
    }

    /// Read some body data, resolving to the amount read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        poll_fn(|cx| self.poll_read(cx, buf)).await
    }

    /// Read the remaining body to a vector.
    pub async fn read_to_vec(&mut self) -> Result<Vec<u8>, Error> {
        let mut v = vec![];
        let mut buf = [0_u8; 16_384];

        loop {
            let amount = self.read(&mut buf).await?;
            if amount == 0 {
                break;
            }
            v.extend_from_slice(&buf[..amount]);
        }

        Ok(v)
    }

    /// The body stream reached its logical end.
    pub fn is_end(&self) -> bool {
        self.done
    }

    /// Trailer headers, present once a chunked body has ended.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Close out the connection after a failure or early abandon.
    fn abort(&mut self) {
        if let Some(state) = self.state.take() {
            let (conn, _) = state.into_stream().into_parts();
            self.pool.discard(conn);
        }
        self.done = true;
    }
}

impl<C: Connect> Drop for RecvBody<C> {
    fn drop(&mut self) {
        if self.state.is_some() {
            trace!("RecvBody dropped before end, closing connection");
            self.abort();
        }
    }
}

impl<C: Connect> AsyncRead for RecvBody<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match ready!(RecvBody::poll_read(this, cx, buf)) {
            Ok(v) => Ok(v).into(),
            Err(e) => Err(e.into_io()).into(),
        }
    }
}

impl<C: Connect> fmt::Debug for RecvBody<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecvBody(done: {})", self.done)
    }
}

impl<C: Connect> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({:?})", self.pool)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prepare_inserts_content_length() {
        let mut headers = HeaderMap::new();
        prepare_headers(&mut headers, &Body::from("hello")).unwrap();
        assert_eq!(headers.get("content-length").unwrap(), "5");
    }

    #[test]
    fn prepare_rejects_length_mismatch() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "2".parse().unwrap());

        let err = prepare_headers(&mut headers, &Body::from("HELLO")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Body data longer than content-length header: 5 > 2"
        );
    }

    #[test]
    fn prepare_leaves_chunked_alone() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", "chunked".parse().unwrap());

        prepare_headers(&mut headers, &Body::from("hello")).unwrap();
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn empty_body_from_conversions() {
        assert!(Body::from(()).is_empty());
        assert!(Body::from(vec![]).is_empty());
        assert!(!Body::from("x").is_empty());
    }
}
