use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while decoding or applying the proxy configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("backend {name} must have at least one server")]
    EmptyBackend { name: String },

    #[error("invalid server '{server}' in backend {name}")]
    InvalidServer { name: String, server: String },

    #[error("unknown scheme '{scheme}' in backend {name}")]
    UnknownScheme { name: String, scheme: String },

    #[error("unknown backend {backend} in route {route}")]
    UnknownBackend { route: String, backend: String },

    #[error("entrypoint {name}: {source}")]
    Bind { name: String, source: io::Error },

    #[error("entrypoint {name}: {message}")]
    Tls { name: String, message: String },
}

/// Errors surfaced by the connection server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server has been shut down. Expected (and silent) when accept
    /// loops unwind during shutdown.
    #[error("server closed")]
    Closed,

    /// Graceful shutdown's deadline fired before all connections were idle.
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Tls(String),
}
