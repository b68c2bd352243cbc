//! Chunked transfer-coding per RFC 7230.
//!
//! The decoder is push based and does no I/O of its own: raw bytes go in
//! via [`ChunkedDecoder::write`], decoded body bytes come back out via
//! [`ChunkedDecoder::read`]. If the input ends mid-state the decoder keeps
//! the partial state and waits for the next `write` call.

use crate::Error;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Cap on a single size/trailer line, chunk extensions included.
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating the hex chunk-size line.
    AwaitingSize,
    /// Copying chunk data through.
    InBody,
    /// Expecting the exact CRLF that terminates chunk data.
    BodyFinished,
    /// Accumulating trailer lines after the zero-size chunk.
    InTrailer,
    /// Zero chunk and trailer fully consumed.
    Done,
}

/// Incremental decoder for chunked transfer-coding.
pub struct ChunkedDecoder {
    state: State,
    /// Partial line accumulator, CR/LF excluded.
    line: Vec<u8>,
    /// A CR has been seen and the matching LF is outstanding.
    seen_cr: bool,
    chunk_size: u64,
    chunk_read: u64,
    /// Decoded bytes not yet handed out.
    out: Vec<u8>,
    pos: usize,
    trailers: HeaderMap,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: State::AwaitingSize,
            line: vec![],
            seen_cr: false,
            chunk_size: 0,
            chunk_read: 0,
            out: vec![],
            pos: 0,
            trailers: HeaderMap::new(),
        }
    }

    /// More raw input is needed before the body is complete.
    pub fn want_more(&self) -> bool {
        self.state != State::Done
    }

    /// Decoded bytes are waiting to be `read` out.
    pub fn data_available(&self) -> bool {
        self.pos < self.out.len()
    }

    /// The terminal chunk and trailer have been consumed.
    pub fn is_end(&self) -> bool {
        self.state == State::Done
    }

    /// Fully decoded and fully drained.
    pub fn is_eof(&self) -> bool {
        self.is_end() && !self.data_available()
    }

    /// A chunk size line has been parsed and body bytes are expected, which
    /// makes bigger raw reads worthwhile.
    pub fn size_known(&self) -> bool {
        self.state == State::InBody
    }

    /// The zero-size chunk has been seen; only trailer lines remain.
    pub fn in_trailer(&self) -> bool {
        self.state == State::InTrailer
    }

    /// Trailer headers seen after the zero-size chunk.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Push raw bytes into the decoder. The entire buffer is always
    /// consumed; partial lines and half-read chunks carry over to the next
    /// call.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut i = 0;

        while i < buf.len() {
            match self.state {
                State::AwaitingSize | State::InTrailer => {
                    i += self.push_line_byte(buf[i])?;
                }

                State::InBody => {
                    let left = (self.chunk_size - self.chunk_read) as usize;
                    let take = left.min(buf.len() - i);

                    self.out.extend_from_slice(&buf[i..i + take]);
                    self.chunk_read += take as u64;
                    i += take;

                    if self.chunk_read == self.chunk_size {
                        trace!("Chunk done: {}", self.chunk_size);
                        self.state = State::BodyFinished;
                    }
                }

                State::BodyFinished => {
                    // Exactly CRLF allowed here, nothing else.
                    let c = buf[i];
                    i += 1;
                    if !self.seen_cr {
                        if c != b'\r' {
                            return Err(Error::Protocol("Missing CRLF after chunk".into()));
                        }
                        self.seen_cr = true;
                    } else {
                        if c != b'\n' {
                            return Err(Error::Protocol("Missing CRLF after chunk".into()));
                        }
                        self.seen_cr = false;
                        self.state = State::AwaitingSize;
                    }
                }

                State::Done => {
                    return Err(Error::Protocol("Data after terminating chunk".into()));
                }
            }
        }

        Ok(())
    }

    /// Read decoded body bytes. Returns the amount copied, 0 when nothing
    /// is buffered.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let has = self.out.len() - self.pos;

        if has == 0 {
            return 0;
        }

        let max = buf.len().min(has);
        buf[..max].copy_from_slice(&self.out[self.pos..self.pos + max]);
        self.pos += max;

        if self.pos == self.out.len() {
            self.pos = 0;
            self.out.clear();
        }

        max
    }

    /// Consume one byte of a CRLF-terminated line, handling the size and
    /// trailer states once a full line is in. Returns bytes consumed (1).
    fn push_line_byte(&mut self, c: u8) -> Result<usize, Error> {
        if self.seen_cr {
            if c != b'\n' {
                // covers the doubled CR case as well.
                return Err(Error::Protocol(format!(
                    "CR without LF in chunk {}",
                    if self.state == State::InTrailer {
                        "trailer"
                    } else {
                        "size"
                    }
                )));
            }
            self.seen_cr = false;
            self.finish_line()?;
            return Ok(1);
        }

        if c == b'\r' {
            self.seen_cr = true;
        } else if c == b'\n' {
            return Err(Error::Protocol("LF without CR in chunk framing".into()));
        } else {
            if self.line.len() >= MAX_LINE {
                return Err(Error::Protocol("Chunk framing line too long".into()));
            }
            self.line.push(c);
        }

        Ok(1)
    }

    fn finish_line(&mut self) -> Result<(), Error> {
        let line = std::mem::replace(&mut self.line, vec![]);

        match self.state {
            State::AwaitingSize => {
                self.chunk_size = parse_size_line(&line)?;
                self.chunk_read = 0;

                if self.chunk_size == 0 {
                    trace!("Terminating chunk, reading trailer");
                    self.state = State::InTrailer;
                } else {
                    trace!("Chunk size: {}", self.chunk_size);
                    self.state = State::InBody;
                }
            }

            State::InTrailer => {
                if line.is_empty() {
                    trace!("Trailer done");
                    self.state = State::Done;
                } else {
                    let (name, value) = split_trailer_line(&line)?;
                    self.trailers.append(name, value);
                }
            }

            _ => panic!("finish_line in incorrect state"),
        }

        Ok(())
    }
}

/// Parse the hex size, stopping at the first space or `;` (chunk
/// extensions are ignored).
fn parse_size_line(line: &[u8]) -> Result<u64, Error> {
    let mut size: u64 = 0;
    let mut any = false;

    for &c in line {
        if c == b' ' || c == b';' {
            break;
        }

        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => {
                return Err(Error::Protocol(format!(
                    "Unexpected char in chunk size: {:?}",
                    c as char
                )));
            }
        };

        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as u64))
            .ok_or_else(|| Error::Protocol("Chunk size out of range".into()))?;
        any = true;
    }

    if !any {
        return Err(Error::Protocol("Empty chunk size line".into()));
    }

    Ok(size)
}

fn split_trailer_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), Error> {
    let colon = line
        .iter()
        .position(|&c| c == b':')
        .ok_or_else(|| Error::Protocol("Malformed trailer line".into()))?;

    let name = HeaderName::from_bytes(trim_bytes(&line[..colon]))
        .map_err(|_| Error::Protocol("Bad trailer header name".into()))?;
    let value = HeaderValue::from_bytes(trim_bytes(&line[colon + 1..]))
        .map_err(|_| Error::Protocol("Bad trailer header value".into()))?;

    Ok((name, value))
}

fn trim_bytes(v: &[u8]) -> &[u8] {
    let start = v.iter().position(|c| !c.is_ascii_whitespace());
    let end = v.iter().rposition(|c| !c.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &v[s..=e],
        _ => &[],
    }
}

/// Encoder counterpart, used for request bodies sent with
/// `transfer-encoding: chunked`.
pub struct ChunkedEncoder;

impl ChunkedEncoder {
    /// Append one chunk to the output buffer. Empty data writes nothing,
    /// since a zero-size chunk would terminate the body.
    pub fn write_chunk(data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");

        Ok(())
    }

    /// Append the terminating zero-size chunk.
    pub fn write_finish(out: &mut Vec<u8>) -> Result<(), Error> {
        out.extend_from_slice(b"0\r\n\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(dec: &mut ChunkedDecoder) -> Vec<u8> {
        let mut v = vec![];
        let mut buf = [0_u8; 7]; // odd size to exercise partial reads
        loop {
            let n = dec.read(&mut buf);
            if n == 0 {
                break;
            }
            v.extend_from_slice(&buf[..n]);
        }
        v
    }

    #[test]
    fn simple_hello() {
        let mut dec = ChunkedDecoder::new();
        dec.write(b"5\r\nhello\r\n0\r\n\r\n").unwrap();

        assert_eq!(decode_all(&mut dec), b"hello");
        assert!(!dec.want_more());
        assert!(dec.is_eof());
    }

    #[test]
    fn split_at_every_boundary() {
        let input = b"4\r\nwiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";

        let mut whole = ChunkedDecoder::new();
        whole.write(input).unwrap();
        let expect = decode_all(&mut whole);
        assert_eq!(expect, b"wikipedia in\r\n\r\nchunks.");

        // any split point must decode identically.
        for split in 0..input.len() {
            let mut dec = ChunkedDecoder::new();
            dec.write(&input[..split]).unwrap();
            dec.write(&input[split..]).unwrap();
            assert_eq!(decode_all(&mut dec), expect, "split at {}", split);
            assert!(dec.is_end());
        }
    }

    #[test]
    fn byte_at_a_time() {
        let input = b"3\r\nabc\r\n0\r\n\r\n";
        let mut dec = ChunkedDecoder::new();
        for &c in input.iter() {
            dec.write(&[c]).unwrap();
        }
        assert_eq!(decode_all(&mut dec), b"abc");
        assert!(dec.is_eof());
    }

    #[test]
    fn doubled_cr_is_protocol_violation() {
        let mut dec = ChunkedDecoder::new();
        let err = dec.write(b"5\r\r\n").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn bad_hex_char() {
        let mut dec = ChunkedDecoder::new();
        let err = dec.write(b"HELLO\r\n").unwrap_err();
        assert_eq!(err.to_string(), "Unexpected char in chunk size: 'H'");
    }

    #[test]
    fn missing_crlf_after_chunk_data() {
        let mut dec = ChunkedDecoder::new();
        let err = dec.write(b"3\r\nabcX").unwrap_err();
        assert_eq!(err.to_string(), "Missing CRLF after chunk");
    }

    #[test]
    fn chunk_extension_ignored() {
        let mut dec = ChunkedDecoder::new();
        dec.write(b"5;ext=1\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(decode_all(&mut dec), b"hello");
    }

    #[test]
    fn trailer_headers_collected() {
        let mut dec = ChunkedDecoder::new();
        dec.write(b"2\r\nok\r\n0\r\nexpires: never\r\nx-sum: 1\r\n\r\n")
            .unwrap();

        assert!(dec.is_end());
        assert_eq!(dec.trailers().get("expires").unwrap(), "never");
        assert_eq!(dec.trailers().get("x-sum").unwrap(), "1");
    }

    #[test]
    fn malformed_trailer_is_protocol_violation() {
        let mut dec = ChunkedDecoder::new();
        let err = dec.write(b"0\r\nnot a header line\r\n\r\n").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn round_trip() {
        for size in &[0_usize, 1, 40_000] {
            let body: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();

            let mut wire = vec![];
            // encode in uneven slices to span multiple chunks.
            for part in body.chunks(11_111) {
                ChunkedEncoder::write_chunk(part, &mut wire).unwrap();
            }
            ChunkedEncoder::write_finish(&mut wire).unwrap();

            let mut dec = ChunkedDecoder::new();
            // decode in slices unrelated to the encode boundaries.
            for part in wire.chunks(4_096) {
                dec.write(part).unwrap();
            }

            let mut got = vec![];
            let mut buf = [0_u8; 1024];
            loop {
                let n = dec.read(&mut buf);
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }

            assert_eq!(got, body, "size {}", size);
            assert!(dec.is_eof());
        }
    }
}
