//! Connection-lifecycle server: accept loops, per-connection state machines
//! with read/write/idle deadlines, keep-alive, and graceful shutdown.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::error::ServerError;
use crate::tls;

use super::request::read_request;
use super::response::BAD_REQUEST_RESPONSE;
use super::{Handler, RawStream, Request, READ_BUFFER_SIZE};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Timeouts applied to every connection. A zero or absent timeout disables
/// the deadline; a zero/absent idle timeout falls back to the read timeout.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Maximum duration to read one request.
    pub read_timeout: Option<Duration>,

    /// Maximum duration, measured from before the handler runs, to finish
    /// writing the response.
    pub write_timeout: Option<Duration>,

    /// Maximum duration to wait for the next request on a kept-alive
    /// connection.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnState {
    New = 0,
    Active = 1,
    Idle = 2,
    Closed = 3,
}

struct ConnHandle {
    state: Arc<AtomicU8>,
    cancel: watch::Sender<()>,
}

struct Inner {
    handler: Arc<dyn Handler>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    in_shutdown: AtomicBool,
    shutdown_tx: watch::Sender<()>,
    listeners: Mutex<HashSet<u64>>,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    next_id: AtomicU64,
}

/// A TCP server speaking HTTP/1.1.
///
/// Cheap to clone; all clones share the same listener and connection state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(handler: Arc<dyn Handler>, opts: ServerOptions) -> Self {
        // A zero timeout disables the deadline.
        let read_timeout = nonzero(opts.read_timeout);
        let (shutdown_tx, _) = watch::channel(());
        Server {
            inner: Arc::new(Inner {
                handler,
                read_timeout,
                write_timeout: nonzero(opts.write_timeout),
                idle_timeout: nonzero(opts.idle_timeout).or(read_timeout),
                in_shutdown: AtomicBool::new(false),
                shutdown_tx,
                listeners: Mutex::new(HashSet::new()),
                conns: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Serves plaintext connections on the given listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with(listener, None).await
    }

    /// Serves TLS-terminated connections on the given listener until
    /// shutdown.
    pub async fn serve_tls(
        &self,
        listener: TcpListener,
        acceptor: TlsAcceptor,
    ) -> Result<(), ServerError> {
        self.serve_with(listener, Some(acceptor)).await
    }

    /// Binds the address and serves plaintext connections.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), ServerError> {
        if self.inner.in_shutdown.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Binds the address and serves TLS connections with the given
    /// certificate material.
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), ServerError> {
        if self.inner.in_shutdown.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }
        let config = tls::load_server_config(cert_path, key_path)?;
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind(addr).await?;
        self.serve_tls(listener, acceptor).await
    }

    async fn serve_with(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<(), ServerError> {
        let inner = &self.inner;
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        let listener_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.add_listener(listener_id) {
            return Err(ServerError::Closed);
        }

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break Err(ServerError::Closed),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_conn(stream, peer, acceptor.clone()),
                    Err(err) if is_transient(&err) => {
                        warn!(error = %err, "accept error");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(err) => {
                        if inner.in_shutdown.load(Ordering::SeqCst) {
                            break Err(ServerError::Closed);
                        }
                        break Err(ServerError::Io(err));
                    }
                },
            }
        };

        // Dropping the listener on return closes it exactly once.
        self.remove_listener(listener_id);
        result
    }

    fn spawn_conn(&self, stream: TcpStream, peer: SocketAddr, acceptor: Option<TlsAcceptor>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(ConnState::New as u8));
        let (cancel_tx, cancel_rx) = watch::channel(());

        {
            let mut conns = self.inner.conns.lock().unwrap();
            conns.insert(
                id,
                ConnHandle {
                    state: Arc::clone(&state),
                    cancel: cancel_tx,
                },
            );
        }

        let server = self.clone();
        tokio::spawn(async move {
            server.serve_conn(stream, peer, acceptor, id, state, cancel_rx).await;
        });
    }

    async fn serve_conn(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        id: u64,
        state: Arc<AtomicU8>,
        mut cancel_rx: watch::Receiver<()>,
    ) {
        let serve = AssertUnwindSafe(self.handle_conn(stream, peer, acceptor, &state)).catch_unwind();
        tokio::select! {
            result = serve => {
                if let Err(payload) = result {
                    error!(peer = %peer, panic = %panic_message(payload), "panic serving connection");
                }
            }
            // Cancellation drops the in-flight read or write and, with it,
            // the socket.
            _ = cancel_rx.changed() => {}
        }

        state.store(ConnState::Closed as u8, Ordering::SeqCst);
        self.inner.conns.lock().unwrap().remove(&id);
    }

    async fn handle_conn(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        state: &AtomicU8,
    ) {
        let inner = &self.inner;

        let stream: Box<dyn RawStream> = match acceptor {
            Some(acceptor) => {
                let limit = inner.read_timeout.or(inner.write_timeout);
                match bounded(limit, acceptor.accept(stream)).await {
                    Some(Ok(tls_stream)) => Box::new(tls_stream),
                    Some(Err(err)) => {
                        debug!(peer = %peer, error = %err, "tls handshake error");
                        return;
                    }
                    None => {
                        debug!(peer = %peer, "tls handshake timed out");
                        return;
                    }
                }
            }
            None => Box::new(stream),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut bufr = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut bufw = BufWriter::new(write_half);

        loop {
            state.store(ConnState::Active as u8, Ordering::SeqCst);

            let mut req: Request = match bounded(inner.read_timeout, read_request(&mut bufr)).await
            {
                Some(Ok(req)) => req,
                Some(Err(err)) => {
                    debug!(peer = %peer, error = %err, "error reading request");
                    let _ = bufw.write_all(BAD_REQUEST_RESPONSE).await;
                    let _ = bufw.flush().await;
                    return;
                }
                None => {
                    debug!(peer = %peer, "timed out reading request");
                    let _ = bufw.write_all(BAD_REQUEST_RESPONSE).await;
                    let _ = bufw.flush().await;
                    return;
                }
            };
            req.remote_addr = Some(peer);

            // The write deadline is absolute: it covers the handler and the
            // response write together.
            let write_deadline = inner.write_timeout.map(|d| Instant::now() + d);

            let Some(resp) = inner.handler.serve(&mut req).await else {
                return;
            };

            let write = async {
                resp.write_to(&mut bufw).await?;
                bufw.flush().await
            };
            let written = match write_deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, write).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(peer = %peer, "timed out writing response");
                        return;
                    }
                },
                None => write.await,
            };
            if let Err(err) = written {
                debug!(peer = %peer, error = %err, "error writing response");
                return;
            }

            if resp.wants_close() || req.close {
                return;
            }

            state.store(ConnState::Idle as u8, Ordering::SeqCst);

            if let Some(idle) = inner.idle_timeout {
                match tokio::time::timeout(idle, bufr.fill_buf()).await {
                    Ok(Ok(buf)) if !buf.is_empty() => {}
                    _ => return,
                }
            }
        }
    }

    /// Gracefully shuts the server down: closes the listeners, then sweeps
    /// idle connections every 100 ms until none remain or the deadline
    /// fires.
    pub async fn shutdown(&self, limit: Option<Duration>) -> Result<(), ServerError> {
        self.inner.in_shutdown.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        let deadline = limit.map(|d| Instant::now() + d);
        let mut ticker = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        loop {
            if self.close_idle_conns() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return Err(ServerError::ShutdownTimeout),
                    _ = ticker.tick() => {}
                },
                None => {
                    ticker.tick().await;
                }
            }
        }
    }

    /// Forcefully closes the server and every connection regardless of
    /// state.
    pub fn close(&self) {
        self.inner.in_shutdown.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        let mut conns = self.inner.conns.lock().unwrap();
        for (_, handle) in conns.drain() {
            let _ = handle.cancel.send(());
        }
    }

    /// The number of connections currently tracked by the server.
    pub fn active_connections(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }

    fn add_listener(&self, id: u64) -> bool {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if self.inner.in_shutdown.load(Ordering::SeqCst) {
            return false;
        }
        listeners.insert(id);
        true
    }

    fn remove_listener(&self, id: u64) {
        self.inner.listeners.lock().unwrap().remove(&id);
    }

    /// Force-closes every idle connection. Returns true when no connections
    /// remain.
    fn close_idle_conns(&self) -> bool {
        let mut conns = self.inner.conns.lock().unwrap();
        conns.retain(|_, handle| {
            if handle.state.load(Ordering::SeqCst) == ConnState::Idle as u8 {
                let _ = handle.cancel.send(());
                false
            } else {
                true
            }
        });
        conns.is_empty()
    }
}

async fn bounded<F>(limit: Option<Duration>, fut: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn nonzero(limit: Option<Duration>) -> Option<Duration> {
    limit.filter(|d| *d > Duration::ZERO)
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
