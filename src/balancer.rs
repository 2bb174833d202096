use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::{Handler, Request, Response};

#[derive(Debug, Error)]
#[error("round robin pool must not be empty")]
pub struct EmptyPool;

/// A round-robin load balancer over a fixed pool of handlers.
///
/// Uses an atomic position counter, no locks; the counter wraps around on
/// overflow. Provides no health checking: a failing backend answers with its
/// own `502` and the next request moves to the next slot.
pub struct RoundRobin {
    handlers: Vec<Arc<dyn Handler>>,
    pos: AtomicUsize,
}

impl RoundRobin {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Result<Self, EmptyPool> {
        if handlers.is_empty() {
            return Err(EmptyPool);
        }
        Ok(RoundRobin {
            handlers,
            pos: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Handler for RoundRobin {
    async fn serve(&self, req: &mut Request) -> Option<Response> {
        let pos = self.pos.fetch_add(1, Ordering::Relaxed) % self.handlers.len();
        self.handlers[pos].serve(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn serve(&self, _req: &mut Request) -> Option<Response> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Some(Response::new(200, "OK"))
        }
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(RoundRobin::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn three_calls_over_two_handlers_split_two_one() {
        let h1 = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let h2 = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let balancer =
            RoundRobin::new(vec![Arc::clone(&h1) as Arc<dyn Handler>, Arc::clone(&h2) as _])
                .unwrap();

        let mut req = Request::new(Method::Get, "/").unwrap();
        for _ in 0..3 {
            balancer.serve(&mut req).await;
        }

        assert_eq!(h1.0.load(Ordering::Relaxed), 2);
        assert_eq!(h2.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn distribution_is_balanced_over_longer_runs() {
        let pool: Vec<Arc<CountingHandler>> = (0..3)
            .map(|_| Arc::new(CountingHandler(AtomicUsize::new(0))))
            .collect();
        let balancer = RoundRobin::new(
            pool.iter()
                .map(|h| Arc::clone(h) as Arc<dyn Handler>)
                .collect(),
        )
        .unwrap();

        let mut req = Request::new(Method::Get, "/").unwrap();
        for _ in 0..10 {
            balancer.serve(&mut req).await;
        }

        // Each backend sees between floor(10/3) and ceil(10/3) requests.
        for handler in &pool {
            let count = handler.0.load(Ordering::Relaxed);
            assert!((3..=4).contains(&count), "got {count}");
        }
    }
}
