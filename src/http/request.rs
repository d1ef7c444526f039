use crate::config::MinDataRate;
use crate::http::body::RequestBody;
use crate::http::headers::Headers;

/// HTTP request methods.
///
/// The parser rejects anything outside this set with `400 Bad Request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Message loop-back test
    TRACE,
}

impl Method {
    /// Parses an HTTP method from its (case-sensitive) token.
    ///
    /// ```
    /// # use sentinel_h1::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body; equivalent to `Content-Length: 0`.
    None,
    ContentLength(u64),
    Chunked,
}

/// A fully parsed request line and header block.
///
/// Built by the parser and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// The request target exactly as received.
    pub target: String,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Headers,
    /// Effective authority: from an absolute-form target when present,
    /// otherwise the `Host` header.
    pub host: Option<String>,
    pub framing: BodyFraming,
    pub expect_continue: bool,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Declared body length, if the request uses `Content-Length` framing.
    pub fn content_length(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::ContentLength(n) => Some(n),
            BodyFraming::None => Some(0),
            BodyFraming::Chunked => None,
        }
    }

    pub fn has_body(&self) -> bool {
        match self.framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => false,
            BodyFraming::ContentLength(_) | BodyFraming::Chunked => true,
        }
    }

    /// Whether the client allows the connection to stay open after this
    /// exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }

    /// `Connection: upgrade` together with an `Upgrade` header.
    pub fn is_upgrade_request(&self) -> bool {
        self.version == Version::Http11
            && self.headers.has_token("Connection", "upgrade")
            && self.headers.contains("Upgrade")
    }
}

/// The request as seen by a handler: the parsed head plus a body stream.
pub struct Request {
    head: RequestHead,
    body: RequestBody,
}

impl Request {
    pub(crate) fn new(head: RequestHead, body: RequestBody) -> Self {
        Self { head, body }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> Method {
        self.head.method
    }

    pub fn path(&self) -> &str {
        &self.head.path
    }

    pub fn query(&self) -> Option<&str> {
        self.head.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn body(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Overrides the minimum body data rate for this request only.
    /// `None` turns rate enforcement off.
    pub fn set_min_data_rate(&self, rate: Option<MinDataRate>) {
        self.body.set_min_data_rate(rate);
    }

    /// Overrides the server-wide synchronous I/O switch for this request's
    /// body and response.
    pub fn set_allow_synchronous_io(&self, allow: bool) {
        self.body.set_allow_synchronous_io(allow);
    }

    pub fn into_parts(self) -> (RequestHead, RequestBody) {
        (self.head, self.body)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("head", &self.head).finish()
    }
}
