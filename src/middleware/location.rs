use std::sync::Arc;

use async_trait::async_trait;

use crate::http::{Handler, Request, Response};

/// Rewrites the request path to a fixed string before forwarding.
pub struct Location {
    inner: Arc<dyn Handler>,
    path: String,
}

impl Location {
    pub fn new(inner: Arc<dyn Handler>, path: impl Into<String>) -> Self {
        Location {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Handler for Location {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        req.url.path = self.path.clone();
        self.inner.serve(req).await
    }
}
