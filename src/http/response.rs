use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{content_length, read_body, read_header_block, read_line, Headers, ParseError};

/// The canned response written verbatim when request parsing fails.
pub(crate) const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\n\r\n400 Bad Request";

/// An HTTP response.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// The response status code.
    pub status: u16,

    /// The response status text.
    pub status_text: String,

    /// The HTTP protocol version. Serialized as `HTTP/1.1` when empty.
    pub proto: String,

    /// The response headers.
    pub headers: Headers,

    /// The response body, fully buffered.
    pub body: Option<Bytes>,

    /// Whether the response wants to close the connection.
    pub close: bool,

    /// Threads an upstream failure through to observers. Never serialized.
    pub error: Option<String>,
}

impl Response {
    pub fn new(status: u16, status_text: &str) -> Self {
        Response {
            status,
            status_text: status_text.to_string(),
            ..Default::default()
        }
    }

    pub fn not_found() -> Self {
        Response::new(404, "Not Found")
    }

    /// Synthesizes the `502 Bad Gateway` carrying an upstream failure.
    pub fn bad_gateway(error: impl std::fmt::Display) -> Self {
        let mut resp = Response::new(502, "Bad Gateway");
        resp.error = Some(error.to_string());
        resp
    }

    /// Whether writing this response should be followed by a close: the
    /// close flag, a `Connection: close` header, or the serialization
    /// defaults (which carry `Connection: close`) all request it.
    pub fn wants_close(&self) -> bool {
        self.close
            || self.headers.is_empty()
            || self.headers.get("Connection").eq_ignore_ascii_case("close")
    }

    /// Serializes the response: status line, headers, blank line, body.
    ///
    /// A response with no headers at all gets the defaults
    /// `Connection: close`, `Content-Type: text/plain; charset=utf-8` and a
    /// `Content-Length` for the body (0 when there is none).
    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let proto = if self.proto.is_empty() {
            "HTTP/1.1"
        } else {
            &self.proto
        };

        let mut head = String::new();
        head.push_str(proto);
        head.push(' ');
        head.push_str(&self.status.to_string());
        head.push(' ');
        head.push_str(&self.status_text);
        head.push_str("\r\n");

        if self.headers.is_empty() {
            let mut defaults = Headers::new();
            defaults.set("Connection", "close");
            defaults.set("Content-Type", "text/plain; charset=utf-8");
            let len = self.body.as_ref().map(Bytes::len).unwrap_or(0);
            defaults.set("Content-Length", &len.to_string());
            defaults.write_to(&mut head);
        } else {
            self.headers.write_to(&mut head);
        }
        head.push_str("\r\n");

        w.write_all(head.as_bytes()).await?;
        if let Some(body) = &self.body {
            w.write_all(body).await?;
        }
        Ok(())
    }
}

/// Reads one response off a buffered stream, as seen from the client side of
/// an upstream connection.
pub(crate) async fn read_response<R>(r: &mut R) -> Result<Response, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    let (proto, status, status_text) = parse_status_line(&line)?;

    let headers = read_header_block(r).await?;

    // 204 and 1xx responses never carry a body, whatever the headers say.
    let body = if status == 204 || status / 100 == 1 {
        None
    } else {
        match content_length(&headers)? {
            Some(n) if n > 0 => Some(read_body(r, n).await?),
            _ => None,
        }
    };

    Ok(Response {
        status,
        status_text: status_text.to_string(),
        proto: proto.to_string(),
        headers,
        body,
        close: false,
        error: None,
    })
}

/// Splits a status line like `HTTP/1.1 200 OK`. The status text may itself
/// contain spaces.
fn parse_status_line(line: &str) -> Result<(&str, u16, &str), ParseError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(proto), Some(code), Some(text)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::MalformedResponse);
    };
    let status = code
        .parse::<u16>()
        .map_err(|_| ParseError::MalformedResponse)?;
    Ok((proto, status, text))
}
