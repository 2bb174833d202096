//! Upstream client: dials an origin, forwards one request with proxy
//! hygiene applied, and reads back one response.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::http::response::read_response;
use crate::http::{Handler, Headers, ParseError, RawStream, Request, Response, READ_BUFFER_SIZE};
use crate::tls;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Headers that apply to a single transport connection and must not be
/// forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Public",
    "Proxy-Authenticate",
    "Transfer-Encoding",
    "Upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream dial failed: {0}")]
    Dial(io::Error),

    #[error("upstream dial timed out")]
    DialTimeout,

    #[error("upstream tls handshake failed: {0}")]
    Handshake(io::Error),

    #[error("upstream write failed: {0}")]
    Write(io::Error),

    #[error("upstream read failed: {0}")]
    Read(ParseError),

    #[error("upstream request timed out")]
    Timeout,
}

/// Options to configure an upstream client. A zero duration means unset.
#[derive(Debug, Clone, Default)]
pub struct UpstreamOptions {
    /// Maximum duration to establish the TCP connection. Defaults to one
    /// second.
    pub dial_timeout: Option<Duration>,

    /// Maximum duration to read the response once the request is written.
    pub timeout: Option<Duration>,
}

impl UpstreamOptions {
    fn dial_timeout(&self) -> Duration {
        match self.dial_timeout {
            Some(d) if d > Duration::ZERO => d,
            _ => DEFAULT_DIAL_TIMEOUT,
        }
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|d| *d > Duration::ZERO)
    }
}

/// A reverse-proxy client for a single origin.
///
/// The connection is closed after one response; there is no pooling.
pub struct Upstream {
    addr: SocketAddr,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    dial_timeout: Duration,
    timeout: Option<Duration>,
}

impl Upstream {
    /// Creates a plaintext upstream client for `addr` (`host:port`). The
    /// address is resolved once, at construction.
    pub async fn new(addr: &str, opts: UpstreamOptions) -> io::Result<Self> {
        Ok(Upstream {
            addr: resolve(addr).await?,
            tls: None,
            dial_timeout: opts.dial_timeout(),
            timeout: opts.request_timeout(),
        })
    }

    /// Creates a TLS upstream client, with the SNI name derived from the
    /// host part of `addr`.
    pub async fn new_tls(addr: &str, opts: UpstreamOptions) -> io::Result<Self> {
        let server_name = ServerName::try_from(host_of(addr).to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let connector = TlsConnector::from(Arc::new(tls::client_config()));
        Ok(Upstream {
            addr: resolve(addr).await?,
            tls: Some((connector, server_name)),
            dial_timeout: opts.dial_timeout(),
            timeout: opts.request_timeout(),
        })
    }

    async fn forward(&self, req: &mut Request) -> Result<Response, UpstreamError> {
        let stream = timeout(self.dial_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| UpstreamError::DialTimeout)?
            .map_err(UpstreamError::Dial)?;

        let stream: Box<dyn RawStream> = match &self.tls {
            Some((connector, server_name)) => Box::new(
                connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(UpstreamError::Handshake)?,
            ),
            None => Box::new(stream),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut bufr = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut bufw = BufWriter::new(write_half);

        let upgrade = req.headers.get("Upgrade").to_string();

        remove_connection_headers(&mut req.headers);
        remove_hop_by_hop_headers(&mut req.headers);
        add_forwarded_header(req);

        // The connection itself is not upgraded, but the origin gets to see
        // the original intent.
        if !upgrade.is_empty() {
            req.headers.set("Connection", "Upgrade");
            req.headers.set("Upgrade", &upgrade);
        }

        req.write_to(&mut bufw).await.map_err(UpstreamError::Write)?;
        bufw.flush().await.map_err(UpstreamError::Write)?;

        let mut resp = match self.timeout {
            Some(limit) => timeout(limit, read_response(&mut bufr))
                .await
                .map_err(|_| UpstreamError::Timeout)?
                .map_err(UpstreamError::Read)?,
            None => read_response(&mut bufr)
                .await
                .map_err(UpstreamError::Read)?,
        };

        remove_connection_headers(&mut resp.headers);
        remove_hop_by_hop_headers(&mut resp.headers);

        Ok(resp)
    }
}

#[async_trait]
impl Handler for Upstream {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        match self.forward(req).await {
            Ok(resp) => Some(resp),
            Err(err) => {
                debug!(addr = %self.addr, error = %err, "upstream error");
                Some(Response::bad_gateway(err))
            }
        }
    }
}

async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}")))
}

/// The host part of a `host:port` address, with IPv6 brackets removed.
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    }
}

/// Removes every header named in the `Connection` header's comma-separated
/// list.
pub(crate) fn remove_connection_headers(headers: &mut Headers) {
    let connection = headers.get("Connection").to_string();
    for name in connection.split(',') {
        let name = name.trim();
        if !name.is_empty() {
            headers.remove(name);
        }
    }
}

/// Removes the fixed hop-by-hop header set.
pub(crate) fn remove_hop_by_hop_headers(headers: &mut Headers) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Appends the client peer IP to `X-Forwarded-For`.
pub(crate) fn add_forwarded_header(req: &mut Request) {
    let Some(addr) = req.remote_addr else {
        return;
    };
    let ip = addr.ip().to_string();
    let existing = req.headers.get("X-Forwarded-For");
    let value = if existing.is_empty() {
        ip
    } else {
        format!("{existing}, {ip}")
    };
    req.headers.set("X-Forwarded-For", &value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn request_with_remote(remote: &str) -> Request {
        let mut req = Request::new(Method::Get, "/").unwrap();
        req.remote_addr = Some(remote.parse().unwrap());
        req
    }

    #[test]
    fn connection_listed_headers_are_removed() {
        let mut headers = Headers::new();
        headers.set("Connection", "X-Custom, X-Other");
        headers.set("X-Custom", "a");
        headers.set("X-Other", "b");
        headers.set("X-Kept", "c");

        remove_connection_headers(&mut headers);
        assert_eq!(headers.get("X-Custom"), "");
        assert_eq!(headers.get("X-Other"), "");
        assert_eq!(headers.get("X-Kept"), "c");
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = Headers::new();
        for name in HOP_BY_HOP_HEADERS {
            headers.set(name, "x");
        }
        headers.set("Content-Type", "text/plain");

        remove_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Content-Type"), "text/plain");
    }

    #[test]
    fn forwarded_header_carries_the_peer_ip() {
        let mut req = request_with_remote("192.0.2.7:1234");
        add_forwarded_header(&mut req);
        assert_eq!(req.headers.get("X-Forwarded-For"), "192.0.2.7");
    }

    #[test]
    fn forwarded_header_appends_to_an_existing_value() {
        let mut req = request_with_remote("192.0.2.7:1234");
        req.headers.set("X-Forwarded-For", "198.51.100.1");
        add_forwarded_header(&mut req);
        assert_eq!(
            req.headers.get("X-Forwarded-For"),
            "198.51.100.1, 192.0.2.7"
        );
    }

    #[test]
    fn zero_timeouts_mean_unset() {
        let opts = UpstreamOptions {
            dial_timeout: Some(Duration::ZERO),
            timeout: Some(Duration::ZERO),
        };
        assert_eq!(opts.dial_timeout(), DEFAULT_DIAL_TIMEOUT);
        assert_eq!(opts.request_timeout(), None);
    }

    #[test]
    fn host_of_splits_ports_and_ipv6() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("[::1]:443"), "::1");
    }

    #[tokio::test]
    async fn dialing_a_closed_port_yields_bad_gateway() {
        let upstream = Upstream::new("127.0.0.1:1", UpstreamOptions::default())
            .await
            .unwrap();
        let mut req = Request::new(Method::Get, "/").unwrap();
        let resp = upstream.serve(&mut req).await.unwrap();
        assert_eq!(resp.status, 502);
        assert_eq!(resp.status_text, "Bad Gateway");
        assert!(resp.error.is_some());
    }
}
