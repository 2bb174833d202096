use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::time::Instant;

use crate::http::{Handler, Request, Response};

/// Records request counts and timings against whatever metrics recorder the
/// embedding process installed. Without a recorder this is a no-op.
pub struct Stats {
    inner: Arc<dyn Handler>,
}

impl Stats {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Stats { inner }
    }
}

#[async_trait]
impl Handler for Stats {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        let start = Instant::now();
        let resp = self.inner.serve(req).await;
        let elapsed = start.elapsed();

        if let Some(resp) = &resp {
            let labels = [
                ("status", resp.status.to_string()),
                ("status_group", format!("{}xx", resp.status / 100)),
            ];
            counter!("proxy_requests_total", &labels).increment(1);
            histogram!("proxy_request_duration_seconds", &labels).record(elapsed.as_secs_f64());
        }

        resp
    }
}
