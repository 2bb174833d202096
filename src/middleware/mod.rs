pub mod access_log;
pub mod cache;
pub mod location;
pub mod stats;

pub use access_log::AccessLog;
pub use cache::{Cache, CacheOptions};
pub use location::Location;
pub use stats::Stats;

use std::sync::Arc;
use std::time::Duration;

use crate::config::MiddlewareSpec;
use crate::http::Handler;

/// Wraps `inner` with the configured middleware, in declaration order: the
/// last spec in the list becomes the outermost wrapper.
pub fn build_chain(specs: &[MiddlewareSpec], inner: Arc<dyn Handler>) -> Arc<dyn Handler> {
    let mut handler = inner;
    for spec in specs {
        handler = match spec {
            MiddlewareSpec::Cache {
                expiry,
                purge,
                ignore_headers,
            } => Arc::new(Cache::new(
                handler,
                CacheOptions {
                    expiry: expiry.unwrap_or(Duration::ZERO),
                    purge: purge.unwrap_or(Duration::ZERO),
                    ignore_headers: *ignore_headers,
                },
            )),
            MiddlewareSpec::Location { path } => Arc::new(Location::new(handler, path.clone())),
        };
    }
    handler
}
