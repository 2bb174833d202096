use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::http::{Handler, Request, Response};

/// Logs every request and its outcome through the tracing subscriber.
pub struct AccessLog {
    inner: Arc<dyn Handler>,
}

impl AccessLog {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        AccessLog { inner }
    }
}

#[async_trait]
impl Handler for AccessLog {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        let method = req.method;
        let host = req.host.clone();
        let path = req.url.path.clone();
        let remote = req
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        let start = Instant::now();
        let resp = self.inner.serve(req).await;
        let elapsed = start.elapsed();

        match &resp {
            Some(resp) => info!(
                %method,
                %host,
                %path,
                %remote,
                status = resp.status,
                error = resp.error.as_deref(),
                elapsed_ms = elapsed.as_millis() as u64,
                "request"
            ),
            None => info!(
                %method,
                %host,
                %path,
                %remote,
                elapsed_ms = elapsed.as_millis() as u64,
                "request declined"
            ),
        }

        resp
    }
}
