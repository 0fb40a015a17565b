//! Shared test utilities for pool tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;

use crate::context::CallContext;
use crate::endpoint::EndpointSet;
use crate::error::Error;
use crate::pool::{DialFn, PooledClient};
use crate::types::MgmtScheme;

/// Dials to a target with this port never complete.
pub const BLOCK_FOREVER_PORT: u16 = 1000;
/// Dials to a target with this port fail with `Unavailable` right away.
pub const FAIL_PROMPTLY_PORT: u16 = 2000;

pub fn targets<S: AsRef<str>>(eps: &[S]) -> EndpointSet {
    EndpointSet::parse(eps).expect("valid test endpoints")
}

/// Minimal pooled client that records whether it was closed.
#[derive(Debug)]
pub struct TestClient {
    id: String,
    targets: EndpointSet,
    closed: AtomicBool,
    closes: Arc<AtomicU64>,
}

impl TestClient {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PooledClient for TestClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn targets(&self) -> &EndpointSet {
        &self.targets
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            panic!("client {} closed twice", self.id);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dialer counting dials and closes, with behavior chosen by target port.
#[derive(Clone)]
pub struct TestDialer {
    delay: Duration,
    next_id: Arc<AtomicU64>,
    dials: Arc<AtomicU64>,
    closes: Arc<AtomicU64>,
}

impl TestDialer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_id: Arc::new(AtomicU64::new(0)),
            dials: Arc::new(AtomicU64::new(0)),
            closes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn make_client(&self, targets: EndpointSet) -> Arc<TestClient> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Arc::new(TestClient {
            id: format!("test-{n}"),
            targets,
            closed: AtomicBool::new(false),
            closes: self.closes.clone(),
        })
    }

    pub fn dial_fn(&self) -> DialFn<TestClient> {
        let dialer = self.clone();
        Arc::new(move |ctx: CallContext, targets: EndpointSet, _scheme: MgmtScheme| {
            let dialer = dialer.clone();
            async move {
                dialer.dials.fetch_add(1, Ordering::SeqCst);
                let port = targets.endpoints()[0].port();
                if port == BLOCK_FOREVER_PORT {
                    ctx.cancellation_token().cancelled().await;
                    return Err(Error::Canceled("dial canceled".to_string()));
                }
                if port == FAIL_PROMPTLY_PORT {
                    return Err(Error::Unavailable(format!("{targets} refused")));
                }
                if !dialer.delay.is_zero() {
                    tokio::time::sleep(dialer.delay).await;
                }
                Ok(dialer.make_client(targets))
            }
            .boxed()
        })
    }
}
