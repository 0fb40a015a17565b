//! Dial function producing clients backed by a [`FakeCluster`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use stormgmt::{
    CallContext, Client, DialFn, EndpointSet, Error, ManagementApi, MgmtScheme, Result,
    RetryPolicy, new_client_id,
};
use tracing::debug;

use super::FakeCluster;

/// Dials to a target set containing this port never complete.
pub const BLOCK_FOREVER_PORT: u16 = 1000;
/// Dials to a target set containing this port fail with `Unavailable`.
pub const FAIL_PROMPTLY_PORT: u16 = 2000;

struct DialerInner {
    cluster: Arc<FakeCluster>,
    retry: RetryPolicy,
    max_delay: Duration,
    rng: Mutex<SmallRng>,
    dials: AtomicU64,
    clients: AtomicU64,
}

/// Dialer whose behavior is picked by target port; every other target
/// connects after a small seeded random delay.
#[derive(Clone)]
pub struct FakeDialer {
    inner: Arc<DialerInner>,
}

impl FakeDialer {
    pub fn new(seed: u64, cluster: Arc<FakeCluster>) -> Self {
        Self::with_retry(seed, cluster, RetryPolicy::default())
    }

    /// Use `retry` for every client this dialer hands out.
    pub fn with_retry(seed: u64, cluster: Arc<FakeCluster>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                cluster,
                retry,
                max_delay: Duration::from_millis(5),
                rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                dials: AtomicU64::new(0),
                clients: AtomicU64::new(0),
            }),
        }
    }

    pub fn cluster(&self) -> &Arc<FakeCluster> {
        &self.inner.cluster
    }

    /// Dial attempts, including failed ones.
    pub fn dials(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Clients successfully handed out.
    pub fn clients(&self) -> u64 {
        self.inner.clients.load(Ordering::SeqCst)
    }

    async fn dial(&self, ctx: CallContext, targets: EndpointSet) -> Result<Arc<Client>> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if targets.iter().any(|e| e.port() == BLOCK_FOREVER_PORT) {
            return ctx.run(std::future::pending()).await;
        }
        if targets.iter().any(|e| e.port() == FAIL_PROMPTLY_PORT) {
            return Err(Error::Unavailable(format!("connection to {targets} refused")));
        }
        let delay = {
            let max = self.inner.max_delay.as_micros() as u64;
            Duration::from_micros(self.inner.rng.lock().random_range(0..=max))
        };
        ctx.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await?;

        let id = new_client_id();
        debug!(client_id = %id, targets = %targets, "fake dial complete");
        self.inner.clients.fetch_add(1, Ordering::SeqCst);
        let api: Arc<dyn ManagementApi> = self.inner.cluster.clone();
        Ok(Arc::new(Client::with_retry(
            id,
            targets,
            api,
            self.inner.retry,
        )))
    }

    pub fn dial_fn(&self) -> DialFn<Client> {
        let dialer = self.clone();
        Arc::new(move |ctx: CallContext, targets: EndpointSet, _scheme: MgmtScheme| {
            let dialer = dialer.clone();
            async move { dialer.dial(ctx, targets).await }.boxed()
        })
    }
}
