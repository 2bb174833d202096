use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::http::{Handler, Request, Response};

/// A route: a pattern and the handler serving it.
///
/// A pattern beginning with `/` matches by request path prefix; any other
/// pattern matches against `host + path`, with the host stripped of its
/// port.
pub struct Route {
    pattern: String,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn new(pattern: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Route {
            pattern: pattern.into(),
            handler,
        }
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        if self.pattern.starts_with('/') {
            return path.starts_with(&self.pattern);
        }
        let mut target = String::with_capacity(host.len() + path.len());
        target.push_str(host);
        target.push_str(path);
        target.starts_with(&self.pattern)
    }
}

/// An HTTP request router.
///
/// Routes are matched in the order they were added; the first matching
/// pattern wins. No match produces `404 Not Found`.
#[derive(Default)]
pub struct Router {
    routes: RwLock<Vec<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, pattern: impl Into<String>, handler: Arc<dyn Handler>) {
        self.routes.write().await.push(Route::new(pattern, handler));
    }
}

#[async_trait]
impl Handler for Router {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        // The read guard covers the scan only, never the handler call.
        let matched = {
            let routes = self.routes.read().await;
            let host = strip_port(&req.host);
            routes
                .iter()
                .find(|route| route.matches(host, &req.url.path))
                .map(|route| Arc::clone(&route.handler))
        };

        match matched {
            Some(handler) => handler.serve(req).await,
            None => Some(Response::not_found()),
        }
    }
}

/// Strips a `:port` suffix from a host, leaving IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.find(']') {
        // Bracketed IPv6 literal, possibly followed by a port.
        return &host[..=end];
    }
    match host.split_once(':') {
        Some((bare, port)) if !port.contains(':') => bare,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StatusHandler(u16);

    #[async_trait]
    impl Handler for StatusHandler {
        async fn serve(&self, _req: &mut Request) -> Option<Response> {
            Some(Response::new(self.0, ""))
        }
    }

    fn handler(status: u16) -> Arc<dyn Handler> {
        Arc::new(StatusHandler(status))
    }

    fn request(host: &str, path: &str) -> Request {
        let mut req = Request::new(crate::http::Method::Get, path).unwrap();
        req.host = host.to_string();
        req
    }

    #[test]
    fn route_match_table() {
        let cases = [
            ("/foo/bar", "example.com", "/foo/bar/baz/bat", true),
            ("example.com/foo/bar", "example.com", "/foo/bar/baz/bat", true),
            ("/foo/bar", "example.com", "/something/bar/baz/bat", false),
            (
                "example.com/foo/bar",
                "example.com",
                "/something/bar/baz/bat",
                false,
            ),
            (
                "something.com/foo/bar",
                "example.com",
                "/foo/bar/baz/bat",
                false,
            ),
        ];

        for (pattern, host, path, want) in cases {
            let route = Route::new(pattern, handler(200));
            assert_eq!(route.matches(host, path), want, "pattern {pattern}");
        }
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let router = Router::new();
        router.add_handler("example.com/foo/bar", handler(200)).await;
        router
            .add_handler("example.com/foo/bar/bat", handler(204))
            .await;

        let mut req = request("example.com:8080", "/foo/bar/bat/baz");
        let resp = router.serve(&mut req).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn no_match_returns_404() {
        let router = Router::new();
        router.add_handler("example.com/foo/bar", handler(200)).await;
        router
            .add_handler("example.com/foo/bar/bat", handler(204))
            .await;

        let mut req = request("something.com", "/foo/bar/bat/baz");
        let resp = router.serve(&mut req).await.unwrap();
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn strip_port_handles_ipv6() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
