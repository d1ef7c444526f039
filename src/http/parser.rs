//! Incremental request-line and header parser.
//!
//! [`RequestParser`] is fed the connection's whole read buffer on every call.
//! It remembers how far it has scanned, consumes complete lines only, and
//! reports a [`RequestHead`] together with the number of bytes the head
//! occupied once the terminating empty line arrives. Feeding the same bytes
//! in different chunkings yields the same head.

use crate::config::Limits;
use crate::http::headers::Headers;
use crate::http::request::{BodyFraming, Method, RequestHead, Version};
use crate::http::response::StatusCode;
use thiserror::Error;

/// Longest method token we recognise ("OPTIONS", "CONNECT").
const MAX_METHOD_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("unrecognized HTTP method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidTarget,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid request header")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("multiple conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("final transfer coding is not \"chunked\"")]
    FinalTransferCodingNotChunked,
    #[error("missing Host header")]
    MissingHost,
    #[error("multiple Host headers")]
    MultipleHosts,
    #[error("Host header does not match the request target")]
    InvalidHost,
    #[error("request line too long")]
    RequestLineTooLong,
    #[error("request headers too large")]
    HeadersTooLarge,
    #[error("too many request headers")]
    TooManyHeaders,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("bad chunk size data")]
    InvalidChunkSize,
    #[error("bad chunk suffix")]
    InvalidChunkSuffix,
    #[error("bad chunked trailer")]
    InvalidTrailer,
}

impl ParseError {
    /// The status code sent back before the connection is closed.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ParseError::RequestLineTooLong => StatusCode::URI_TOO_LONG,
            ParseError::HeadersTooLarge | ParseError::TooManyHeaders => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ParseError::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Size limits applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Request line length including its CRLF.
    pub max_request_line_size: usize,
    /// Header block length including every CRLF and the final empty line.
    pub max_headers_total_size: usize,
    pub max_header_count: usize,
    /// Largest `Content-Length` accepted.
    pub max_body_size: Option<u64>,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self::from(&Limits::default())
    }
}

impl From<&Limits> for ParseLimits {
    fn from(limits: &Limits) -> Self {
        Self {
            max_request_line_size: limits.max_request_line_size,
            max_headers_total_size: limits.max_request_headers_total_size,
            max_header_count: limits.max_request_header_count,
            max_body_size: limits.max_request_body_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
}

#[derive(Debug)]
struct RequestLine {
    method: Method,
    target: String,
    path: String,
    query: Option<String>,
    authority: Option<String>,
    version: Version,
}

/// Stateful HTTP/1.x request head parser.
#[derive(Debug)]
pub struct RequestParser {
    limits: ParseLimits,
    state: State,
    /// Offset of the first byte of the line being parsed.
    line_start: usize,
    /// Bytes before this offset are known not to contain `\n`.
    scanned: usize,
    headers_start: usize,
    line: Option<RequestLine>,
    headers: Headers,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            state: State::RequestLine,
            line_start: 0,
            scanned: 0,
            headers_start: 0,
            line: None,
            headers: Headers::with_capacity(16),
        }
    }

    /// True once any byte of a request has been consumed.
    pub fn in_progress(&self) -> bool {
        self.state != State::RequestLine || self.scanned > 0
    }

    /// Forgets any partially parsed request.
    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.line_start = 0;
        self.scanned = 0;
        self.headers_start = 0;
        self.line = None;
        self.headers.clear();
    }

    /// Parses as much of `buf` as possible.
    ///
    /// `buf` must start at the same offset on every call until a head is
    /// returned; the caller then drops the returned number of bytes from the
    /// front of its buffer. Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ParseError> {
        loop {
            let from = self.scanned.max(self.line_start);
            let Some(rel) = buf[from..].iter().position(|&b| b == b'\n') else {
                self.check_partial(&buf[self.line_start..])?;
                self.scanned = buf.len();
                return Ok(None);
            };

            let lf = from + rel;
            if lf == self.line_start || buf[lf - 1] != b'\r' {
                return Err(match self.state {
                    State::RequestLine => ParseError::InvalidRequestLine,
                    State::Headers => ParseError::InvalidHeader,
                });
            }
            let line = &buf[self.line_start..lf - 1];
            let next = lf + 1;

            match self.state {
                State::RequestLine => {
                    if next - self.line_start > self.limits.max_request_line_size {
                        return Err(ParseError::RequestLineTooLong);
                    }
                    self.line = Some(parse_request_line(line)?);
                    self.state = State::Headers;
                    self.headers_start = next;
                }
                State::Headers => {
                    if next - self.headers_start > self.limits.max_headers_total_size {
                        return Err(ParseError::HeadersTooLarge);
                    }
                    if line.is_empty() {
                        let head = self.finish()?;
                        self.reset();
                        return Ok(Some((head, next)));
                    }
                    if self.headers.len() >= self.limits.max_header_count {
                        return Err(ParseError::TooManyHeaders);
                    }
                    let (name, value) = parse_header_line(line)?;
                    self.headers.append(name, value);
                }
            }

            self.line_start = next;
            self.scanned = next;
        }
    }

    /// Rejects an unterminated line early when its prefix is already invalid.
    fn check_partial(&self, partial: &[u8]) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => {
                if partial.len() > self.limits.max_request_line_size {
                    return Err(ParseError::RequestLineTooLong);
                }
                let partial = partial.strip_suffix(b"\r").unwrap_or(partial);
                check_request_line_prefix(partial)
            }
            State::Headers => {
                let pending = self.line_start - self.headers_start + partial.len();
                if pending > self.limits.max_headers_total_size {
                    return Err(ParseError::HeadersTooLarge);
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<RequestHead, ParseError> {
        let line = self.line.take().ok_or(ParseError::InvalidRequestLine)?;
        let headers = std::mem::take(&mut self.headers);

        if headers.get_all("Host").nth(1).is_some() {
            return Err(ParseError::MultipleHosts);
        }
        let host_header = headers.get("Host").map(str::to_string);
        if line.version == Version::Http11 && host_header.is_none() {
            return Err(ParseError::MissingHost);
        }

        let host = match line.authority {
            Some(authority) => {
                if let Some(h) = host_header.as_deref() {
                    let default_port = scheme_default_port(&line.target);
                    if !h.is_empty() && !same_authority(h, &authority, default_port) {
                        return Err(ParseError::InvalidHost);
                    }
                }
                Some(authority)
            }
            None => host_header,
        };

        let framing = body_framing(&headers)?;
        if let (BodyFraming::ContentLength(n), Some(max)) = (framing, self.limits.max_body_size) {
            if n > max {
                return Err(ParseError::BodyTooLarge);
            }
        }

        let expect_continue = line.version == Version::Http11
            && headers
                .get("Expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));

        Ok(RequestHead {
            method: line.method,
            target: line.target,
            path: line.path,
            query: line.query,
            version: line.version,
            headers,
            host,
            framing,
            expect_continue,
        })
    }
}

/// Port implied by an absolute-form target's scheme.
fn scheme_default_port(target: &str) -> Option<u16> {
    let (scheme, _) = target.split_once("://")?;
    if scheme.eq_ignore_ascii_case("http") {
        Some(80)
    } else if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else {
        None
    }
}

/// Compares two `host[:port]` values, treating an explicit default port as
/// absent.
fn same_authority(a: &str, b: &str, default_port: Option<u16>) -> bool {
    let normalize = |value: &str| {
        let value = value.to_ascii_lowercase();
        match (default_port, value.rsplit_once(':')) {
            (Some(default), Some((host, port)))
                if !host.is_empty() && port.parse::<u16>() == Ok(default) =>
            {
                host.to_string()
            }
            _ => value,
        }
    };
    normalize(a) == normalize(b)
}

/// One-shot parse of a complete buffer.
pub fn parse_request_head(
    buf: &[u8],
    limits: &ParseLimits,
) -> Result<Option<(RequestHead, usize)>, ParseError> {
    RequestParser::new(*limits).parse(buf)
}

fn is_ctl(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Left-to-right validity check shared by partial and complete request lines.
fn check_request_line_prefix(line: &[u8]) -> Result<(), ParseError> {
    let method_end = line.iter().position(|&b| b == b' ');
    let method = &line[..method_end.unwrap_or(line.len())];
    if method.len() > MAX_METHOD_LEN || !method.iter().all(u8::is_ascii_uppercase) {
        return Err(ParseError::InvalidMethod);
    }

    if let Some(end) = method_end {
        let method = std::str::from_utf8(method).map_err(|_| ParseError::InvalidMethod)?;
        if Method::from_str(method).is_none() {
            return Err(ParseError::InvalidMethod);
        }
        if line[end..].iter().any(|&b| is_ctl(b)) {
            return Err(ParseError::InvalidRequestLine);
        }
    }

    Ok(())
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    check_request_line_prefix(line)?;

    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidTarget)?;
    let mut parts = line.splitn(3, ' ');
    let method_str = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    if target.is_empty() || version.contains(' ') {
        return Err(ParseError::InvalidRequestLine);
    }

    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        v if v.starts_with("HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidRequestLine),
    };

    if !target.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ParseError::InvalidTarget);
    }

    let (path, query, authority) = parse_target(method, target)?;

    Ok(RequestLine {
        method,
        target: target.to_string(),
        path,
        query,
        authority,
        version,
    })
}

type Target = (String, Option<String>, Option<String>);

fn parse_target(method: Method, target: &str) -> Result<Target, ParseError> {
    if target.starts_with('/') {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };
        return Ok((path.to_string(), query, None));
    }

    if target == "*" {
        if method != Method::OPTIONS {
            return Err(ParseError::InvalidTarget);
        }
        return Ok(("*".to_string(), None, None));
    }

    if method == Method::CONNECT {
        let (host, port) = target.rsplit_once(':').ok_or(ParseError::InvalidTarget)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ParseError::InvalidTarget);
        }
        return Ok((String::new(), None, Some(target.to_string())));
    }

    if target.contains("://") {
        let url = url::Url::parse(target).map_err(|_| ParseError::InvalidTarget)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ParseError::InvalidTarget);
        }
        let host = url.host_str().ok_or(ParseError::InvalidTarget)?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        return Ok((
            url.path().to_string(),
            url.query().map(str::to_string),
            Some(authority),
        ));
    }

    Err(ParseError::InvalidTarget)
}

pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    // obs-fold continuation lines are rejected outright
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }

    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|&b| is_ctl(b) && b != b'\t') {
        return Err(ParseError::InvalidHeader);
    }

    // name is all token chars, so it is ASCII
    let name = String::from_utf8_lossy(name).into_owned();
    let value = String::from_utf8_lossy(value).into_owned();
    Ok((name, value))
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = v {
        v = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = v {
        v = rest;
    }
    v
}

fn body_framing(headers: &Headers) -> Result<BodyFraming, ParseError> {
    if headers.contains("Transfer-Encoding") {
        // Transfer-Encoding overrides any Content-Length
        return match headers.last_token("Transfer-Encoding") {
            Some(t) if t.eq_ignore_ascii_case("chunked") => Ok(BodyFraming::Chunked),
            _ => Err(ParseError::FinalTransferCodingNotChunked),
        };
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("Content-Length") {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength);
            }
            let n = part
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidContentLength)?;
            if length.is_some_and(|prev| prev != n) {
                return Err(ParseError::ConflictingContentLength);
            }
            length = Some(n);
        }
    }

    Ok(match length {
        Some(n) => BodyFraming::ContentLength(n),
        None => BodyFraming::None,
    })
}
