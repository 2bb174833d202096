use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{content_length, read_body, read_header_block, read_line, Headers, ParseError};

/// The fixed set of HTTP/1.1 request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }
}

impl FromStr for Method {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            _ => Err(ParseError::InvalidMethod),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed request-target: path, raw query, and (for absolute-form
/// targets) the authority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestUrl {
    pub path: String,
    pub query: Option<String>,
    pub host: Option<String>,
}

impl RequestUrl {
    /// Parses a request-target in origin form (`/path?query`), absolute form
    /// (`scheme://host/path?query`), or asterisk form (`*`).
    pub fn parse(target: &str) -> Result<Self, ParseError> {
        if target == "*" {
            return Ok(RequestUrl {
                path: "*".to_string(),
                ..Default::default()
            });
        }

        if target.starts_with('/') {
            let (path, query) = split_query(target);
            return Ok(RequestUrl {
                path: path.to_string(),
                query: query.map(str::to_string),
                host: None,
            });
        }

        let (scheme, rest) = target
            .split_once("://")
            .ok_or(ParseError::MalformedRequest)?;
        if scheme.is_empty() || rest.is_empty() {
            return Err(ParseError::MalformedRequest);
        }

        let (authority, path_and_query) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(ParseError::MalformedRequest);
        }

        let (path, query) = split_query(path_and_query);
        Ok(RequestUrl {
            path: path.to_string(),
            query: query.map(str::to_string),
            host: Some(authority.to_string()),
        })
    }

    /// The path and query as sent on a request line.
    pub fn request_uri(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }
}

impl fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.request_uri())
    }
}

fn split_query(s: &str) -> (&str, Option<&str>) {
    match s.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (s, None),
    }
}

/// An HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method on the request.
    pub method: Method,

    /// The request-target exactly as received on the wire.
    pub target: String,

    /// The parsed request URL.
    pub url: RequestUrl,

    /// The HTTP protocol version.
    pub proto: String,

    /// The request host, from the `Host` header or the URL authority.
    pub host: String,

    /// The request headers.
    pub headers: Headers,

    /// The request body, fully buffered.
    pub body: Option<Bytes>,

    /// The remote address of the peer that sent the request.
    pub remote_addr: Option<SocketAddr>,

    /// Whether the request asks to close the connection.
    pub close: bool,
}

impl Request {
    pub fn new(method: Method, target: &str) -> Result<Self, ParseError> {
        let url = RequestUrl::parse(target)?;
        let host = url.host.clone().unwrap_or_default();
        Ok(Request {
            method,
            target: target.to_string(),
            url,
            proto: "HTTP/1.1".to_string(),
            host,
            headers: Headers::new(),
            body: None,
            remote_addr: None,
            close: false,
        })
    }

    /// Serializes the request: request line, headers, blank line, body.
    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut head = String::new();
        head.push_str(self.method.as_str());
        head.push(' ');
        head.push_str(&self.url.request_uri());
        head.push(' ');
        head.push_str(&self.proto);
        head.push_str("\r\n");
        self.headers.write_to(&mut head);
        head.push_str("\r\n");

        w.write_all(head.as_bytes()).await?;
        if let Some(body) = &self.body {
            w.write_all(body).await?;
        }
        Ok(())
    }
}

/// Reads one request off a buffered stream.
pub(crate) async fn read_request<R>(r: &mut R) -> Result<Request, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let (method, target, proto) = parse_request_line(&line)?;
    let method = method.parse::<Method>()?;
    let url = RequestUrl::parse(target)?;

    let headers = read_header_block(r).await?;

    let mut host = headers.get("Host").to_string();
    if host.is_empty() {
        host = url.host.clone().unwrap_or_default();
    }

    let close = headers.get("Connection").eq_ignore_ascii_case("close");

    let body = match content_length(&headers)? {
        Some(n) if n > 0 => Some(read_body(r, n).await?),
        _ => None,
    };

    Ok(Request {
        method,
        target: target.to_string(),
        url,
        proto: proto.to_string(),
        host,
        headers,
        body,
        remote_addr: None,
        close,
    })
}

/// Splits a request line like `GET /test HTTP/1.1` into exactly three fields.
fn parse_request_line(line: &str) -> Result<(&str, &str, &str), ParseError> {
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(proto), None)
            if !method.is_empty() && !target.is_empty() && !proto.is_empty() =>
        {
            Ok((method, target, proto))
        }
        _ => Err(ParseError::MalformedRequest),
    }
}
