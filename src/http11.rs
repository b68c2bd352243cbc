//! Request serialization and response head parsing.

use crate::AsyncRead;
use crate::Error;
use futures_util::ready;
use http::header::{HeaderName, HeaderValue};
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Max number of headers to parse from a response head.
pub const MAX_RESPONSE_HEADERS: usize = 128;

/// Cap on the entire response head (status line + headers).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Block size for reads while scanning for the end of the head. Bytes past
/// the CRLFCRLF belong to the body and are replayed through the prefix
/// buffer.
const HEAD_READ_SIZE: usize = 4096;

/// Write an http/1.1 request head to a buffer.
#[allow(clippy::write_with_newline)]
pub fn write_request(req: &http::Request<()>, buf: &mut Vec<u8>) -> Result<(), Error> {
    let mut w = io::Cursor::new(buf);

    // Path and query
    let pq = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let ver = match req.version() {
        http::Version::HTTP_10 => "1.0",
        http::Version::HTTP_11 => "1.1",
        v => return Err(Error::User(format!("Unsupported http version: {:?}", v))),
    };

    write!(w, "{} {} HTTP/{}\r\n", req.method(), pq, ver).map_err(Error::Send)?;

    let has_host = req.headers().contains_key("host");

    if !has_host {
        let default_port: u16 = match req.uri().scheme_str() {
            Some("https") => 443,
            Some("http") => 80,
            _ => 0,
        };
        let port = match req.uri().port_u16() {
            Some(p) if p != default_port => p,
            _ => 0,
        };
        // fall back on uri host
        if let Some(h) = req.uri().host() {
            write!(w, "host: {}", h).map_err(Error::Send)?;
            if port != 0 {
                write!(w, ":{}", port).map_err(Error::Send)?;
            }
            write!(w, "\r\n").map_err(Error::Send)?;
        }
    }

    // the rest of the headers.
    for (name, value) in req.headers() {
        write!(w, "{}: ", name).map_err(Error::Send)?;
        w.write_all(value.as_bytes()).map_err(Error::Send)?;
        write!(w, "\r\n").map_err(Error::Send)?;
    }
    write!(w, "\r\n").map_err(Error::Send)?;

    debug!(
        "write_request: {:?}",
        String::from_utf8_lossy(w.get_ref())
    );

    Ok(())
}

fn version_of(v: Option<u8>) -> http::Version {
    match v {
        Some(0) => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    }
}

/// Parse a complete http/1.1 response head. The caller guarantees `buf`
/// ends at the CRLFCRLF, so a partial parse here is a protocol violation.
pub fn try_parse_response(buf: &[u8]) -> Result<(http::Response<()>, usize), Error> {
    trace!("try_parse_response: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut parser = httparse::Response::new(&mut headers);

    let status = parser.parse(buf)?;

    if status.is_partial() {
        return Err(Error::Protocol("Partial response head".into()));
    }

    let mut bld = http::Response::builder().version(version_of(parser.version));

    if let Some(code) = parser.code {
        bld = bld.status(code);
    }

    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld
        .body(())
        .map_err(|e| Error::Protocol(format!("Bad response head: {}", e)))?;

    let len = status.unwrap();

    debug!("try_parse_response success: {:?}", built);

    Ok((built, len))
}

/// Read blocks from `io` into `buf` until the head-terminating CRLFCRLF is
/// in. Returns the offset just past it; any bytes beyond belong to the
/// body. `scanned` carries the scan position across polls.
pub fn poll_read_head<S>(
    cx: &mut Context<'_>,
    io: &mut S,
    buf: &mut Vec<u8>,
    scanned: &mut usize,
) -> Poll<Result<usize, Error>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_crlfcrlf(buf, scanned) {
            return Ok(end).into();
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Protocol("Response head too big".into())).into();
        }

        let mut block = [0_u8; HEAD_READ_SIZE];
        let amount = match ready!(Pin::new(&mut *io).poll_read(cx, &mut block[..])) {
            Ok(v) => v,
            Err(e) => return Err(Error::Receive(e)).into(),
        };

        if amount == 0 {
            return Err(Error::Closed("EOF before complete http11 header".into())).into();
        }

        buf.extend_from_slice(&block[..amount]);
    }
}

/// Scan for CRLFCRLF from `*scanned`, which is advanced to where the next
/// scan can resume (overlapping by 3 so a sequence split across reads is
/// still found).
fn find_crlfcrlf(buf: &[u8], scanned: &mut usize) -> Option<usize> {
    const END_OF_HEADER: &[u8] = b"\r\n\r\n";

    let from = scanned.saturating_sub(3);

    if buf.len() >= END_OF_HEADER.len() {
        for i in from..=buf.len() - END_OF_HEADER.len() {
            if &buf[i..i + END_OF_HEADER.len()] == END_OF_HEADER {
                return Some(i + END_OF_HEADER.len());
            }
        }
    }

    *scanned = buf.len();
    None
}
