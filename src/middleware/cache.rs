//! TTL response cache with periodic purge and header-aware admission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::http::{Handler, Headers, Request, Response};

/// Cache-Control directives that veto admission.
const NO_CACHE_DIRECTIVES: &[&str] = &["no-cache", "no-store", "private"];

/// Options to configure the response cache.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Time-to-live for admitted entries. Zero means entries never expire.
    pub expiry: Duration,

    /// Interval between purge sweeps. Zero disables the purge task.
    pub purge: Duration,

    /// Admit everything, ignoring Cache-Control and Set-Cookie.
    pub ignore_headers: bool,
}

/// A recorded response. The body is immutable after admission; every hit
/// hands out an independent (cheaply cloned) view of it.
struct CacheEntry {
    status: u16,
    status_text: String,
    proto: String,
    close: bool,
    headers: Headers,
    body: Option<Bytes>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn record(resp: &Response, expires_at: Option<Instant>) -> Self {
        CacheEntry {
            status: resp.status,
            status_text: resp.status_text.clone(),
            proto: resp.proto.clone(),
            close: resp.close,
            headers: resp.headers.clone(),
            body: resp.body.clone(),
            expires_at,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn to_response(&self) -> Response {
        Response {
            status: self.status,
            status_text: self.status_text.clone(),
            proto: self.proto.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            close: self.close,
            error: None,
        }
    }
}

/// Caches responses keyed by `host + url`.
pub struct Cache {
    inner: Arc<dyn Handler>,
    entries: Arc<DashMap<String, CacheEntry>>,
    expiry: Duration,
    ignore_headers: bool,
    purge_task: Option<JoinHandle<()>>,
}

impl Cache {
    pub fn new(inner: Arc<dyn Handler>, opts: CacheOptions) -> Self {
        let entries: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());

        let purge_task = (opts.purge > Duration::ZERO).then(|| {
            let entries = Arc::clone(&entries);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(opts.purge);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let now = Instant::now();
                    entries.retain(|_, entry| !entry.expired(now));
                }
            })
        });

        Cache {
            inner,
            entries,
            expiry: opts.expiry,
            ignore_headers: opts.ignore_headers,
            purge_task,
        }
    }

    fn cache_key(req: &Request) -> String {
        format!("{}{}", req.host, req.url)
    }

    fn should_cache(&self, req: &Request, resp: &Response) -> bool {
        if self.ignore_headers {
            return true;
        }

        let request_control = req.headers.get("Cache-Control").to_ascii_lowercase();
        if NO_CACHE_DIRECTIVES.contains(&request_control.as_str()) {
            return false;
        }

        let response_control = resp.headers.get("Cache-Control").to_ascii_lowercase();
        if NO_CACHE_DIRECTIVES.contains(&response_control.as_str()) {
            return false;
        }

        resp.headers.get("Set-Cookie").is_empty()
    }

    fn expires_at(&self) -> Option<Instant> {
        (self.expiry > Duration::ZERO).then(|| Instant::now() + self.expiry)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Some(task) = &self.purge_task {
            task.abort();
        }
    }
}

#[async_trait]
impl Handler for Cache {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        let key = Self::cache_key(req);

        if let Some(entry) = self.entries.get(&key) {
            if !entry.expired(Instant::now()) {
                return Some(entry.to_response());
            }
        }

        let resp = self.inner.serve(req).await?;

        if self.should_cache(req, &resp) {
            self.entries
                .insert(key, CacheEntry::record(&resp, self.expires_at()));
        }

        Some(resp)
    }
}
