//! A configurable HTTP/1.1 reverse proxy: TLS-terminating entrypoints, a
//! hand-written message codec, prefix routing, round-robin load balancing,
//! a TTL response cache, and graceful shutdown.

pub mod balancer;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;
pub mod service;
pub mod tls;
pub mod upstream;

pub use config::Config;
pub use error::{ConfigError, ServerError};
pub use http::{Handler, Headers, Method, Request, Response, Server, ServerOptions};
pub use router::Router;
pub use service::Service;
