//! Hand-written HTTP/1.1 message codec and connection server.

pub mod header;
pub mod request;
pub mod response;
pub mod server;

pub use header::Headers;
pub use request::{Method, Request, RequestUrl};
pub use response::Response;
pub use server::{Server, ServerOptions};

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};

/// Buffer size for per-connection readers, sized for typical header blocks.
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// A handler of HTTP requests.
///
/// Returning `None` declines the request and terminates the connection
/// without a response.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, req: &mut Request) -> Option<Response>;
}

/// A bidirectional byte stream, TLS-wrapped or plain.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Errors produced while reading an HTTP message off the wire.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid request")]
    MalformedRequest,

    #[error("invalid method")]
    InvalidMethod,

    #[error("invalid response")]
    MalformedResponse,

    #[error("invalid header")]
    InvalidHeader,

    #[error("bad content length")]
    BadContentLength,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads one CRLF-terminated line, without the terminator.
pub(crate) async fn read_line<R>(r: &mut R) -> Result<String, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = r.read_line(&mut line).await?;
    if n == 0 {
        return Err(ParseError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Reads MIME-style headers up to and including the empty line.
pub(crate) async fn read_header_block<R>(r: &mut R) -> Result<Headers, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_line(r).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            return Err(ParseError::InvalidHeader);
        }
        headers.add(name, value.trim());
    }
}

/// Parses the Content-Length header per message-body rules: at most one
/// value, numeric and non-negative. An absent or empty value means no body.
pub(crate) fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let values = headers.values("Content-Length");
    if values.len() > 1 {
        return Err(ParseError::BadContentLength);
    }
    let Some(value) = values.first() else {
        return Ok(None);
    };
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(Some(n as u64)),
        _ => Err(ParseError::BadContentLength),
    }
}

/// Reads exactly `n` body bytes into memory.
pub(crate) async fn read_body<R>(r: &mut R, n: u64) -> Result<Bytes, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
