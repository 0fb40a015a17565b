//! Connection pool caching one live client per endpoint set.
//!
//! The first caller asking for an endpoint set creates a member slot and
//! starts the dial in a background task; every caller for the same set then
//! waits on the member's one-shot completion signal. Waiters are bounded by
//! their own [`CallContext`], so a caller giving up does not abort the dial
//! for the others. Failed dials are evicted immediately.
//!
//! Returned clients are reference counted. When the count drops to zero the
//! member's expiry is armed at `now + linger`, and a single reaper task
//! evicts and closes expired members every reap cycle.
//!
//! Lock order is pool indexes first, then member state. Members are never
//! locked across an await point.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_DIAL_TIMEOUT, DEFAULT_LINGER_TIME, DEFAULT_REAP_CYCLE, PoolConfig};
use crate::context::CallContext;
use crate::endpoint::EndpointSet;
use crate::error::{Error, Result};
use crate::types::MgmtScheme;

/// A connection that can be cached by [`ClientPool`].
pub trait PooledClient: Send + Sync + 'static {
    /// Stable opaque identifier, unique among live clients.
    fn id(&self) -> &str;

    /// The endpoint set this client was dialed for.
    fn targets(&self) -> &EndpointSet;

    /// Tear down the connection. Called exactly once by the pool.
    fn close(&self);
}

/// Produces a connected client for an endpoint set.
///
/// The context carries the pool's dial timeout and is canceled when the pool
/// closes.
pub type DialFn<C> = Arc<
    dyn Fn(CallContext, EndpointSet, MgmtScheme) -> BoxFuture<'static, Result<Arc<C>>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub dial_timeout: Duration,
    pub linger_time: Duration,
    pub reap_cycle: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            linger_time: DEFAULT_LINGER_TIME,
            reap_cycle: DEFAULT_REAP_CYCLE,
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            linger_time: config.linger_time(),
            reap_cycle: config.reap_cycle(),
        }
    }
}

/// Sizes of the pool's two indexes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Members keyed by endpoint set, including ones still dialing.
    pub members: usize,
    /// Successfully dialed clients keyed by client ID.
    pub live: usize,
}

struct MemberState<C> {
    client: Option<Arc<C>>,
    refs: u64,
    /// `None` while in use.
    expire_by: Option<Instant>,
    dial_err: Option<Error>,
    /// Set by the reaper so a racing waiter retries its lookup.
    reaped: bool,
}

struct Member<C> {
    key: String,
    dial_cancel: CancellationToken,
    done: watch::Sender<bool>,
    state: Mutex<MemberState<C>>,
}

impl<C> Member<C> {
    fn new(key: &str, dial_cancel: CancellationToken) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            key: key.to_string(),
            dial_cancel,
            done,
            state: Mutex::new(MemberState {
                client: None,
                refs: 0,
                expire_by: None,
                dial_err: None,
                reaped: false,
            }),
        }
    }
}

struct Indexes<C> {
    pool: HashMap<String, Arc<Member<C>>>,
    lut: HashMap<String, Arc<Member<C>>>,
    closed: bool,
}

struct PoolInner<C> {
    opts: PoolOptions,
    dialer: DialFn<C>,
    dial_cancel: CancellationToken,
    dials: TaskTracker,
    reaper_stop: CancellationToken,
    indexes: Mutex<Indexes<C>>,
}

fn closing_error() -> Error {
    Error::Canceled("client connection is closing".to_string())
}

impl<C: PooledClient> PoolInner<C> {
    fn lookup_or_dial(
        self: &Arc<Self>,
        key: &str,
        targets: &EndpointSet,
        scheme: MgmtScheme,
    ) -> Result<Arc<Member<C>>> {
        let mut idx = self.indexes.lock();
        if idx.closed {
            return Err(Error::Canceled("pool is closing".to_string()));
        }
        if let Some(member) = idx.pool.get(key) {
            return Ok(member.clone());
        }

        let member = Arc::new(Member::new(key, self.dial_cancel.child_token()));
        idx.pool.insert(key.to_string(), member.clone());

        let inner = self.clone();
        let dialing = member.clone();
        let targets = targets.clone();
        self.dials
            .spawn(async move { inner.dial(dialing, targets, scheme).await });
        Ok(member)
    }

    async fn dial(self: Arc<Self>, member: Arc<Member<C>>, targets: EndpointSet, scheme: MgmtScheme) {
        let ctx = CallContext::with_cancellation(member.dial_cancel.clone())
            .with_timeout(self.opts.dial_timeout);
        debug!(targets = %targets, scheme = %scheme, "dialing");

        let result = ctx
            .run((self.dialer)(ctx.clone(), targets.clone(), scheme))
            .await
            .map_err(|e| match e {
                Error::DeadlineExceeded(_) => Error::DeadlineExceeded(format!(
                    "timed out connecting to {targets} after {:?}",
                    self.opts.dial_timeout
                )),
                other => other,
            });

        let client_id = {
            let mut st = member.state.lock();
            match result {
                Ok(client) => {
                    let id = client.id().to_string();
                    st.client = Some(client);
                    st.expire_by = Some(Instant::now() + self.opts.linger_time);
                    Ok(id)
                }
                Err(e) => {
                    st.dial_err = Some(e.clone());
                    Err(e)
                }
            }
        };

        {
            let mut idx = self.indexes.lock();
            match &client_id {
                Ok(id) => {
                    if idx.lut.insert(id.clone(), member.clone()).is_some() {
                        panic!("dialer returned duplicate client ID {id} for {targets}");
                    }
                }
                Err(_) => {
                    let ours = idx
                        .pool
                        .get(&member.key)
                        .is_some_and(|m| Arc::ptr_eq(m, &member));
                    if ours {
                        idx.pool.remove(&member.key);
                    }
                }
            }
        }

        match client_id {
            Ok(id) => info!(client_id = %id, targets = %targets, "connected"),
            Err(e) => warn!(targets = %targets, error = %e, "failed to connect"),
        }
        member.dial_cancel.cancel();
        member.done.send_replace(true);
    }

    /// Wait for `member`'s dial and take a reference on its client.
    ///
    /// `None` means the member was reaped while waiting and the caller
    /// should look the endpoint set up again.
    async fn claim(&self, ctx: &CallContext, member: &Member<C>) -> Result<Option<Arc<C>>> {
        let mut done = member.done.subscribe();
        ctx.run(async {
            done.wait_for(|finished| *finished)
                .await
                .map(|_| ())
                .map_err(|_| Error::internal("dial completion signal dropped"))
        })
        .await
        .map_err(|e| match e {
            Error::DeadlineExceeded(_) => Error::DeadlineExceeded(format!(
                "timed out waiting for connection to {}",
                member.key
            )),
            other => other,
        })?;

        let mut st = member.state.lock();
        if st.reaped {
            debug!(targets = %member.key, "client reaped while waiting, retrying");
            return Ok(None);
        }
        if let Some(err) = &st.dial_err {
            return Err(err.clone());
        }
        let Some(client) = st.client.clone() else {
            return Err(Error::internal(format!(
                "connection to {} finished without a client or an error",
                member.key
            )));
        };
        st.refs += 1;
        st.expire_by = None;
        Ok(Some(client))
    }

    fn put_client(&self, client: &C) {
        let member = {
            let idx = self.indexes.lock();
            if idx.closed {
                return;
            }
            match idx.lut.get(client.id()) {
                Some(member) => member.clone(),
                None => panic!(
                    "returned unknown client {} for {} to the pool",
                    client.id(),
                    client.targets()
                ),
            }
        };

        let mut st = member.state.lock();
        if st.refs == 0 {
            panic!(
                "client {} for {} returned to the pool more times than it was taken",
                client.id(),
                client.targets()
            );
        }
        st.refs -= 1;
        if st.refs == 0 {
            st.expire_by = Some(Instant::now() + self.opts.linger_time);
        }
    }

    fn reap_clients(&self) {
        let now = Instant::now();
        let mut reaped = Vec::new();
        {
            let mut idx = self.indexes.lock();
            let live: Vec<(String, Arc<Member<C>>)> = idx
                .lut
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect();
            for (id, member) in live {
                let mut st = member.state.lock();
                let expired = st.refs == 0 && st.expire_by.is_some_and(|t| t <= now);
                if !expired {
                    continue;
                }
                let Some(client) = st.client.take() else {
                    panic!("live pool member {} has no client", member.key);
                };
                idx.lut.remove(&id);
                idx.pool.remove(&member.key);
                st.reaped = true;
                st.dial_err = Some(closing_error());
                reaped.push(client);
            }
        }

        for client in reaped {
            info!(client_id = %client.id(), targets = %client.targets(), "closing idle client");
            client.close();
        }
    }

    fn close_clients(&self) {
        let mut closing = Vec::new();
        {
            let mut idx = self.indexes.lock();
            let live: Vec<Arc<Member<C>>> = idx.lut.drain().map(|(_, m)| m).collect();
            for member in live {
                let mut st = member.state.lock();
                let Some(client) = st.client.take() else {
                    panic!("live pool member {} has no client", member.key);
                };
                st.dial_err = Some(closing_error());
                idx.pool.remove(&member.key);
                closing.push(client);
            }
        }

        for client in closing {
            debug!(client_id = %client.id(), targets = %client.targets(), "closing client");
            client.close();
        }
    }

    async fn reap_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.opts.reap_cycle);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.reaper_stop.cancelled() => {
                    self.close_clients();
                    return;
                }
                _ = ticker.tick() => self.reap_clients(),
            }
        }
    }
}

/// Cache of one live client per distinct endpoint set.
///
/// Must be created inside a tokio runtime; the reaper task is spawned on
/// construction. Call [`close`](Self::close) for an orderly shutdown.
pub struct ClientPool<C: PooledClient> {
    inner: Arc<PoolInner<C>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PooledClient> ClientPool<C> {
    pub fn new(opts: PoolOptions, dialer: DialFn<C>) -> Self {
        let inner = Arc::new(PoolInner {
            opts,
            dialer,
            dial_cancel: CancellationToken::new(),
            dials: TaskTracker::new(),
            reaper_stop: CancellationToken::new(),
            indexes: Mutex::new(Indexes {
                pool: HashMap::new(),
                lut: HashMap::new(),
                closed: false,
            }),
        });
        let reaper = tokio::spawn(inner.clone().reap_loop());
        Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.opts
    }

    /// Borrow the client for `targets`, dialing it if needed.
    ///
    /// Every successful call must be paired with one
    /// [`put_client`](Self::put_client).
    pub async fn get_client(
        &self,
        ctx: &CallContext,
        targets: &EndpointSet,
        scheme: MgmtScheme,
    ) -> Result<Arc<C>> {
        targets.validate()?;
        let key = targets.key();

        loop {
            let member = self.inner.lookup_or_dial(&key, targets, scheme)?;
            if let Some(client) = self.inner.claim(ctx, &member).await? {
                return Ok(client);
            }
        }
    }

    /// Return a client obtained from [`get_client`](Self::get_client).
    ///
    /// # Panics
    ///
    /// If the client was not handed out by this pool, or is returned more
    /// times than it was taken.
    pub fn put_client(&self, client: Arc<C>) {
        self.inner.put_client(&client);
    }

    /// Borrow a client that is returned to the pool when the lease drops.
    pub async fn lease(
        &self,
        ctx: &CallContext,
        targets: &EndpointSet,
        scheme: MgmtScheme,
    ) -> Result<Lease<C>> {
        let client = self.get_client(ctx, targets, scheme).await?;
        Ok(Lease {
            client: Some(client),
            pool: self.inner.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idx = self.inner.indexes.lock();
        PoolStats {
            members: idx.pool.len(),
            live: idx.lut.len(),
        }
    }

    /// Number of outstanding borrows of `client`, if it is live in the pool.
    pub fn use_count(&self, client: &C) -> Option<u64> {
        let member = self.inner.indexes.lock().lut.get(client.id()).cloned()?;
        let refs = member.state.lock().refs;
        Some(refs)
    }

    /// Cancel in-flight dials, wait for them, then close every client.
    ///
    /// # Panics
    ///
    /// If either index is non-empty afterwards.
    pub async fn close(&self) {
        {
            let mut idx = self.inner.indexes.lock();
            if idx.closed {
                return;
            }
            idx.closed = true;
        }

        self.inner.dial_cancel.cancel();
        self.inner.dials.close();
        self.inner.dials.wait().await;

        self.inner.reaper_stop.cancel();
        let reaper = self.reaper.lock().take();
        match reaper {
            Some(handle) => {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                    self.inner.close_clients();
                }
            }
            None => self.inner.close_clients(),
        }

        let idx = self.inner.indexes.lock();
        if !idx.pool.is_empty() || !idx.lut.is_empty() {
            panic!(
                "pool not empty after close: {} members, {} live clients",
                idx.pool.len(),
                idx.lut.len()
            );
        }
        info!("client pool closed");
    }
}

impl<C: PooledClient> Drop for ClientPool<C> {
    fn drop(&mut self) {
        // outstanding leases are ignored once the reaper closes every client
        self.inner.indexes.lock().closed = true;
        self.inner.dial_cancel.cancel();
        self.inner.reaper_stop.cancel();
    }
}

/// A pooled client that is returned to its pool on drop.
pub struct Lease<C: PooledClient> {
    client: Option<Arc<C>>,
    pool: Arc<PoolInner<C>>,
}

impl<C: PooledClient> Lease<C> {
    pub fn client(&self) -> &Arc<C> {
        match &self.client {
            Some(client) => client,
            None => unreachable!("lease is only emptied on drop"),
        }
    }
}

impl<C: PooledClient> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client()
    }
}

impl<C: PooledClient> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.put_client(&client);
        }
    }
}
