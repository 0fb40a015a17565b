//! Connection pool simulation harness.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use stormgmt::{
    CallContext, Client, ClientPool, EndpointSet, Error, MgmtScheme, PoolOptions,
};

use super::SimulationError;
use crate::fake::{FAIL_PROMPTLY_PORT, FakeCluster, FakeDialer};

const LINGER: Duration = Duration::from_millis(20);
const REAP_CYCLE: Duration = Duration::from_millis(5);

/// Actions that can be performed in simulation.
#[derive(Debug, Clone)]
pub enum PoolAction {
    Get { target: usize },
    Put { target: usize },
    GetFailing,
    Idle { millis: u64 },
}

/// Handles the simulation currently holds, per target set.
pub struct PoolOracle {
    held: Vec<Vec<Arc<Client>>>,
}

impl PoolOracle {
    pub fn new(targets: usize) -> Self {
        Self {
            held: vec![Vec::new(); targets],
        }
    }

    pub fn held(&self, target: usize) -> &[Arc<Client>] {
        &self.held[target]
    }

    pub fn take(&mut self, target: usize, client: Arc<Client>) {
        self.held[target].push(client);
    }

    pub fn give_back(&mut self, target: usize) -> Option<Arc<Client>> {
        self.held[target].pop()
    }

    pub fn drain(&mut self) -> Vec<Arc<Client>> {
        self.held.iter_mut().flat_map(|h| h.drain(..)).collect()
    }

    /// The client ID the pool must hand out for `target`, if any is held.
    pub fn expected_id(&self, target: usize) -> Option<&str> {
        self.held[target].first().map(|c| c.id())
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct PoolSimStats {
    pub operations: u64,
    pub gets: u64,
    pub puts: u64,
    pub failed_gets: u64,
    pub idles: u64,
}

/// Pool simulation harness.
pub struct PoolHarness {
    rng: SmallRng,
    pool: ClientPool<Client>,
    dialer: FakeDialer,
    targets: Vec<EndpointSet>,
    failing: EndpointSet,
    oracle: PoolOracle,
    stats: PoolSimStats,
}

impl PoolHarness {
    /// Must be called from within a tokio runtime.
    pub fn new(seed: u64, target_count: usize) -> Result<Self, SimulationError> {
        let cluster = Arc::new(FakeCluster::new(seed));
        let dialer = FakeDialer::new(seed, cluster);
        let opts = PoolOptions {
            dial_timeout: Duration::from_secs(1),
            linger_time: LINGER,
            reap_cycle: REAP_CYCLE,
        };
        let pool = ClientPool::new(opts, dialer.dial_fn());
        let targets = (0..target_count)
            .map(|i| {
                EndpointSet::parse(&[format!("10.0.{i}.1:443"), format!("10.0.{i}.2:443")])
            })
            .collect::<stormgmt::Result<Vec<_>>>()?;
        let failing = EndpointSet::parse(&[format!("10.9.9.9:{FAIL_PROMPTLY_PORT}")])?;
        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            pool,
            dialer,
            targets,
            failing,
            oracle: PoolOracle::new(target_count),
            stats: PoolSimStats::default(),
        })
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
            self.validate_invariants()?;
        }
        Ok(())
    }

    fn validate_invariants(&self) -> Result<(), SimulationError> {
        let stats = self.pool.stats();
        if stats.members > self.targets.len() || stats.live > self.targets.len() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "pool holds {} members and {} live clients for {} target sets",
                    stats.members,
                    stats.live,
                    self.targets.len()
                ),
            });
        }
        for (t, held) in self.oracle.held.iter().enumerate() {
            let Some(first) = held.first() else { continue };
            let refs = self.pool.use_count(first);
            if refs != Some(held.len() as u64) {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "target {t}: pool use count {refs:?}, oracle holds {}",
                        held.len()
                    ),
                });
            }
            for (other, other_held) in self.oracle.held.iter().enumerate() {
                if other != t && other_held.first().is_some_and(|c| c.id() == first.id()) {
                    return Err(SimulationError::Mismatch {
                        context: format!("targets {t} and {other} share client {}", first.id()),
                    });
                }
            }
        }
        Ok(())
    }

    fn sample_action(&mut self) -> PoolAction {
        let target = self.rng.random_range(0..self.targets.len());
        match self.rng.random_range(0..100) {
            0..45 => PoolAction::Get { target },
            45..85 => PoolAction::Put { target },
            85..90 => PoolAction::GetFailing,
            _ => PoolAction::Idle {
                millis: self.rng.random_range(0..40),
            },
        }
    }

    /// Execute a single action (public for harness testing).
    pub async fn execute(&mut self, action: PoolAction) -> Result<(), SimulationError> {
        match action {
            PoolAction::Get { target } => {
                self.stats.gets += 1;
                let ctx = CallContext::background().with_timeout(Duration::from_secs(2));
                let client = self
                    .pool
                    .get_client(&ctx, &self.targets[target], MgmtScheme::Grpc)
                    .await?;
                if let Some(expected) = self.oracle.expected_id(target) {
                    if expected != client.id() {
                        return Err(SimulationError::Mismatch {
                            context: format!(
                                "get({target}) returned client {} while {expected} is held",
                                client.id()
                            ),
                        });
                    }
                }
                self.oracle.take(target, client);
            }
            PoolAction::Put { target } => {
                if let Some(client) = self.oracle.give_back(target) {
                    self.stats.puts += 1;
                    self.pool.put_client(client);
                }
            }
            PoolAction::GetFailing => {
                self.stats.failed_gets += 1;
                let ctx = CallContext::background().with_timeout(Duration::from_secs(2));
                match self
                    .pool
                    .get_client(&ctx, &self.failing, MgmtScheme::Grpc)
                    .await
                {
                    Err(Error::Unavailable(_)) => {}
                    Err(e) => return Err(SimulationError::Unexpected(e.to_string())),
                    Ok(client) => {
                        return Err(SimulationError::Mismatch {
                            context: format!("dial to failing target returned {}", client.id()),
                        });
                    }
                }
            }
            PoolAction::Idle { millis } => {
                self.stats.idles += 1;
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }
        Ok(())
    }

    /// Return every held client, close the pool and check that every
    /// client the dialer produced was closed exactly once.
    pub async fn finish(&mut self) -> Result<(), SimulationError> {
        for client in self.oracle.drain() {
            self.pool.put_client(client);
        }
        self.pool.close().await;

        let stats = self.pool.stats();
        if stats.members != 0 || stats.live != 0 {
            return Err(SimulationError::Mismatch {
                context: format!("pool not empty after close: {stats:?}"),
            });
        }
        let closes = self.dialer.cluster().closes();
        if closes != self.dialer.clients() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "{} clients dialed but {closes} closed",
                    self.dialer.clients()
                ),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> &PoolSimStats {
        &self.stats
    }
}
