//! Assembles backends, routes and entrypoints from a parsed configuration
//! into a running reverse proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};
use url::Url;

use crate::balancer::RoundRobin;
use crate::config::{Backend, Config, Entrypoint, Route, ServerOpts};
use crate::error::{ConfigError, ServerError};
use crate::http::{Handler, Server, ServerOptions};
use crate::middleware::{self, AccessLog, Stats};
use crate::router::Router;
use crate::upstream::{Upstream, UpstreamOptions};
use crate::tls;

/// A reverse proxy service: one server fronting a router, a set of named
/// backends, and any number of listening entrypoints.
pub struct Service {
    backends: HashMap<String, Arc<dyn Handler>>,
    router: Arc<Router>,
    server: Server,
}

impl Service {
    /// Builds and starts a service from a parsed configuration. Listeners
    /// are bound here; serving happens in background tasks.
    pub async fn from_config(config: &Config) -> Result<Service, ConfigError> {
        let mut service = Service::new(&config.server);

        for (name, backend) in &config.backends {
            service.add_backend(name, backend).await?;
        }
        for (name, route) in &config.routes {
            service.add_route(name, route).await?;
        }
        for (name, entrypoint) in &config.entrypoints {
            service.add_entrypoint(name, entrypoint).await?;
        }

        Ok(service)
    }

    pub fn new(opts: &ServerOpts) -> Service {
        let router = Arc::new(Router::new());

        let mut handler: Arc<dyn Handler> = Arc::clone(&router) as Arc<dyn Handler>;
        handler = Arc::new(Stats::new(handler));
        if opts.access_log {
            handler = Arc::new(AccessLog::new(handler));
        }

        let server = Server::new(
            handler,
            ServerOptions {
                read_timeout: opts.read_timeout,
                write_timeout: opts.write_timeout,
                idle_timeout: opts.idle_timeout,
            },
        );

        Service {
            backends: HashMap::new(),
            router,
            server,
        }
    }

    /// Adds a named backend: a round-robin balancer over one upstream
    /// client per configured server URL.
    pub async fn add_backend(&mut self, name: &str, backend: &Backend) -> Result<(), ConfigError> {
        if backend.servers.is_empty() {
            return Err(ConfigError::EmptyBackend {
                name: name.to_string(),
            });
        }

        let invalid = |server: &str| ConfigError::InvalidServer {
            name: name.to_string(),
            server: server.to_string(),
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::with_capacity(backend.servers.len());
        for server in &backend.servers {
            // A bare host:port gets the default scheme.
            let normalized = if server.contains("://") {
                server.clone()
            } else {
                format!("http://{server}")
            };
            let url = Url::parse(&normalized).map_err(|_| invalid(server))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::UnknownScheme {
                    name: name.to_string(),
                    scheme: url.scheme().to_string(),
                });
            }

            let host = url.host_str().ok_or_else(|| invalid(server))?;
            let port = url.port_or_known_default().ok_or_else(|| invalid(server))?;
            let addr = format!("{host}:{port}");

            let opts = UpstreamOptions {
                timeout: backend.timeout,
                ..Default::default()
            };

            let handler: Arc<dyn Handler> = if url.scheme() == "https" {
                Arc::new(
                    Upstream::new_tls(&addr, opts)
                        .await
                        .map_err(|_| invalid(server))?,
                )
            } else {
                Arc::new(Upstream::new(&addr, opts).await.map_err(|_| invalid(server))?)
            };
            handlers.push(handler);
        }

        let balancer = RoundRobin::new(handlers).map_err(|_| ConfigError::EmptyBackend {
            name: name.to_string(),
        })?;
        self.backends.insert(name.to_string(), Arc::new(balancer));
        Ok(())
    }

    /// Adds a route whose handler is the configured middleware chain in
    /// front of the named backend.
    pub async fn add_route(&self, name: &str, route: &Route) -> Result<(), ConfigError> {
        let backend = self
            .backends
            .get(&route.backend)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBackend {
                route: name.to_string(),
                backend: route.backend.clone(),
            })?;

        let handler = middleware::build_chain(&route.middleware, backend);
        self.router.add_handler(&route.pattern, handler).await;
        Ok(())
    }

    /// Binds the entrypoint and starts serving it in the background, with
    /// TLS termination when certificate material is configured.
    pub async fn add_entrypoint(
        &self,
        name: &str,
        entrypoint: &Entrypoint,
    ) -> Result<(), ConfigError> {
        let acceptor = match &entrypoint.tls {
            Some(cert) if cert.is_configured() => {
                let config = tls::load_server_config(&cert.cert_file, &cert.key_file).map_err(
                    |err| ConfigError::Tls {
                        name: name.to_string(),
                        message: err.to_string(),
                    },
                )?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            _ => None,
        };

        let listener =
            TcpListener::bind(&entrypoint.address)
                .await
                .map_err(|source| ConfigError::Bind {
                    name: name.to_string(),
                    source,
                })?;

        info!(
            entrypoint = %name,
            address = %entrypoint.address,
            tls = acceptor.is_some(),
            "starting entrypoint"
        );

        let server = self.server.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => server.serve_tls(listener, acceptor).await,
                None => server.serve(listener).await,
            };
            match result {
                Ok(()) | Err(ServerError::Closed) => {}
                Err(err) => error!(entrypoint = %name, error = %err, "entrypoint error"),
            }
        });

        Ok(())
    }

    /// Attempts to shut the service down within the given window.
    pub async fn shutdown(&self, limit: Option<Duration>) -> Result<(), ServerError> {
        self.server.shutdown(limit).await
    }

    /// Forcefully closes the service.
    pub fn close(&self) {
        self.server.close();
    }

    /// The underlying connection server.
    pub fn server(&self) -> &Server {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(servers: &[&str]) -> Backend {
        Backend {
            servers: servers.iter().map(|s| s.to_string()).collect(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn backend_must_have_servers() {
        let mut service = Service::new(&ServerOpts::default());
        let err = service.add_backend("empty", &backend(&[])).await.unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBackend { .. }));
    }

    #[tokio::test]
    async fn backend_rejects_unknown_schemes() {
        let mut service = Service::new(&ServerOpts::default());
        let err = service
            .add_backend("ftp", &backend(&["ftp://127.0.0.1:21"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownScheme { .. }));
    }

    #[tokio::test]
    async fn backend_accepts_http_https_and_bare_addresses() {
        tls::install_default_crypto_provider();
        let mut service = Service::new(&ServerOpts::default());
        service
            .add_backend(
                "mixed",
                &backend(&[
                    "http://127.0.0.1:9080",
                    "https://127.0.0.1:9443",
                    "127.0.0.1:9081",
                ]),
            )
            .await
            .unwrap();
        assert!(service.backends.contains_key("mixed"));
    }

    #[tokio::test]
    async fn route_requires_a_known_backend() {
        let service = Service::new(&ServerOpts::default());
        let route = Route {
            pattern: "/".to_string(),
            backend: "missing".to_string(),
            middleware: Vec::new(),
        };
        let err = service.add_route("r", &route).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBackend { .. }));
    }
}
