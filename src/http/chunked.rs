//! Chunked transfer coding (RFC 7230 section 4.1).
//!
//! Each chunk is `hex-size CRLF data CRLF`; a zero-size chunk ends the body
//! and may be followed by trailer fields up to a final empty line.

use bytes::{Buf, Bytes, BytesMut};

use crate::http::headers::Headers;
use crate::http::parser::{ParseError, parse_header_line};

/// The zero-size chunk plus the empty trailer section.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Longest chunk-size line (size plus extensions) we accept.
const MAX_CHUNK_LINE: usize = 1024;

const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// Appends one chunk frame for `data` to `out`. Empty input writes nothing,
/// since an empty chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.reserve(data.len() + 20);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Data(Bytes),
    /// The input ends mid-frame.
    NeedMore,
    /// The terminal chunk and trailers have been consumed.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Incremental chunked body decoder.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    trailers: Headers,
    trailer_bytes: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            trailers: Headers::new(),
            trailer_bytes: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Consumes framing from `input` and returns at most `max` bytes of
    /// chunk data. Bytes past the end of the body are left in `input`.
    pub fn decode(&mut self, input: &mut BytesMut, max: usize) -> Result<Decoded, ParseError> {
        loop {
            match self.state {
                State::Size => {
                    let Some(line) = take_line(input, ParseError::InvalidChunkSize)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::Data(size)
                    };
                }
                State::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let n = remaining.min(input.len() as u64).min(max.max(1) as u64) as usize;
                    let data = input.split_to(n).freeze();
                    self.state = if remaining == n as u64 {
                        State::DataEnd
                    } else {
                        State::Data(remaining - n as u64)
                    };
                    return Ok(Decoded::Data(data));
                }
                State::DataEnd => {
                    if input.len() < 2 {
                        if input.first().is_some_and(|&b| b != b'\r') {
                            return Err(ParseError::InvalidChunkSuffix);
                        }
                        return Ok(Decoded::NeedMore);
                    }
                    if &input[..2] != b"\r\n" {
                        return Err(ParseError::InvalidChunkSuffix);
                    }
                    input.advance(2);
                    self.state = State::Size;
                }
                State::Trailers => {
                    let Some(line) = take_line(input, ParseError::InvalidTrailer)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(Decoded::Done);
                    }
                    self.trailer_bytes += line.len() + 2;
                    if self.trailer_bytes > MAX_TRAILER_BYTES {
                        return Err(ParseError::InvalidTrailer);
                    }
                    let (name, value) =
                        parse_header_line(&line).map_err(|_| ParseError::InvalidTrailer)?;
                    self.trailers.append(name, value);
                }
                State::Done => return Ok(Decoded::Done),
            }
        }
    }
}

/// Splits one CRLF-terminated line off `input`, without the CRLF.
fn take_line(input: &mut BytesMut, err: ParseError) -> Result<Option<BytesMut>, ParseError> {
    match input.iter().position(|&b| b == b'\n') {
        Some(lf) => {
            if lf == 0 || input[lf - 1] != b'\r' || lf > MAX_CHUNK_LINE {
                return Err(err);
            }
            let mut line = input.split_to(lf + 1);
            line.truncate(lf - 1);
            Ok(Some(line))
        }
        None if input.len() > MAX_CHUNK_LINE => Err(err),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let end = line.iter().position(|&b| b == b';').unwrap_or(line.len());
    let mut size = &line[..end];
    while let [rest @ .., b' ' | b'\t'] = size {
        size = rest;
    }

    if size.is_empty() || size.len() > 16 || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunkSize);
    }

    let size = std::str::from_utf8(size).map_err(|_| ParseError::InvalidChunkSize)?;
    u64::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunkSize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(wire: &[u8]) -> Result<(Vec<u8>, ChunkedDecoder, BytesMut), ParseError> {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::from(wire);
        let mut body = Vec::new();
        loop {
            match decoder.decode(&mut input, 4096)? {
                Decoded::Data(d) => body.extend_from_slice(&d),
                Decoded::NeedMore | Decoded::Done => return Ok((body, decoder, input)),
            }
        }
    }

    #[test]
    fn encodes_lowercase_hex_frames() {
        let mut out = BytesMut::new();
        encode_chunk(b"Hello ", &mut out);
        encode_chunk(&[b'x'; 26], &mut out);
        encode_chunk(b"", &mut out);
        assert!(out.starts_with(b"6\r\nHello \r\n1a\r\n"));
        assert!(out.ends_with(b"x\r\n"));
    }

    #[test]
    fn decodes_body_and_leaves_next_message() {
        let (body, decoder, rest) =
            decode_all(b"5\r\nHello\r\n7;ext=1\r\n, world\r\n0\r\n\r\nGET /").unwrap();
        assert_eq!(body, b"Hello, world");
        assert!(decoder.is_done());
        assert_eq!(&rest[..], b"GET /");
    }

    #[test]
    fn collects_trailers() {
        let (_, decoder, _) = decode_all(b"1\r\na\r\n0\r\nX-Sum: 42\r\n\r\n").unwrap();
        assert_eq!(decoder.trailers().get("x-sum"), Some("42"));
    }

    #[test]
    fn byte_at_a_time_decoding() {
        let wire = b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::new();
        let mut body = Vec::new();
        for &b in wire.iter() {
            input.extend_from_slice(&[b]);
            loop {
                match decoder.decode(&mut input, 4096).unwrap() {
                    Decoded::Data(d) => body.extend_from_slice(&d),
                    _ => break,
                }
            }
        }
        assert_eq!(body, b"abcde");
        assert!(decoder.is_done());
    }

    #[test]
    fn respects_max_read_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::from(&b"a\r\n0123456789\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut input, 4).unwrap(),
            Decoded::Data(Bytes::from_static(b"0123"))
        );
        assert_eq!(
            decoder.decode(&mut input, 100).unwrap(),
            Decoded::Data(Bytes::from_static(b"456789"))
        );
    }

    #[test]
    fn malformed_size_line() {
        assert_eq!(
            decode_all(b"zz\r\nabc\r\n").unwrap_err(),
            ParseError::InvalidChunkSize
        );
        assert_eq!(
            decode_all(b"\r\n").unwrap_err(),
            ParseError::InvalidChunkSize
        );
        assert_eq!(
            decode_all(b"11111111111111111\r\n").unwrap_err(),
            ParseError::InvalidChunkSize
        );
    }

    #[test]
    fn missing_chunk_suffix() {
        assert_eq!(
            decode_all(b"3\r\nabcX\r\n").unwrap_err(),
            ParseError::InvalidChunkSuffix
        );
    }
}
