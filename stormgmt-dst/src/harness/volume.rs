//! Volume lifecycle simulation harness.
//!
//! Several clients share one flaky [`FakeCluster`]. Every round creates a
//! volume (retrying the whole create on transient failures), lets a random
//! number of clients add themselves to its ACL concurrently, and deletes it.
//! The oracle is simple: one volume per name, and no ACL entry lost to a
//! racing writer.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use stormgmt::types::normalize_acl;
use stormgmt::{
    ACL_ALLOW_NONE, Backoff, CallContext, Client, EndpointSet, Error, ManagementApi,
    RetryPolicy, Volume, VolumeSpec, VolumeState, VolumeUpdate, new_client_id, with_retries,
};
use tracing::debug;
use uuid::Uuid;

use super::SimulationError;
use crate::fake::FakeCluster;

const PROJECT: &str = "dst";
const MAX_ADDERS: usize = 4;
const TRANSIENT_RETRIES: u32 = 100;

/// Retry policy for simulation: same shape as production, much faster.
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        create: Backoff::new(Duration::from_millis(1), 1.5, Duration::from_millis(10), 50),
        delete: Backoff::new(Duration::from_millis(1), 1.5, Duration::from_millis(10), 50),
        update: Backoff::new(Duration::from_millis(1), 1.5, Duration::from_millis(10), 200),
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct VolumeSimStats {
    pub rounds: u64,
    pub creates: u64,
    pub acl_updates: u64,
    pub deletes: u64,
    /// Whole operations re-run after an `Unavailable`.
    pub transient_retries: u64,
}

fn add_host(
    host: &str,
) -> impl FnMut(&Volume) -> stormgmt::Result<Option<VolumeUpdate>> + Send + '_ {
    move |vol: &Volume| {
        if vol.acl.iter().any(|h| h == host) {
            return Ok(None);
        }
        let mut acl: Vec<&str> = vol
            .acl
            .iter()
            .map(String::as_str)
            .filter(|h| *h != ACL_ALLOW_NONE)
            .collect();
        acl.push(host);
        Ok(Some(VolumeUpdate {
            acl: Some(normalize_acl(&acl)),
            ..Default::default()
        }))
    }
}

/// Run `op` until it stops failing with `Unavailable`, counting re-runs.
async fn retry_transient<T, F, Fut>(retries: &AtomicU64, op: F) -> stormgmt::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = stormgmt::Result<T>>,
{
    with_retries(TRANSIENT_RETRIES, Duration::from_millis(1), || {
        let fut = op();
        async move {
            match fut.await {
                Ok(v) => Ok(Some(v)),
                Err(Error::Unavailable(msg)) => {
                    debug!(error = %msg, "transient failure, retrying");
                    retries.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }
    })
    .await
}

/// Volume lifecycle simulation harness.
pub struct VolumeHarness {
    rng: SmallRng,
    cluster: Arc<FakeCluster>,
    clients: Vec<Client>,
    stats: VolumeSimStats,
}

impl VolumeHarness {
    /// `flakiness` is the probability of any remote call failing with
    /// `Unavailable`.
    pub fn new(seed: u64, flakiness: f64) -> Result<Self, SimulationError> {
        let cluster = Arc::new(FakeCluster::new(seed));
        cluster.set_flakiness(flakiness);
        let targets = EndpointSet::parse(&["10.0.0.1:443", "10.0.0.2:443"])?;
        let clients = (0..MAX_ADDERS)
            .map(|_| {
                let api: Arc<dyn ManagementApi> = cluster.clone();
                Client::with_retry(new_client_id(), targets.clone(), api, fast_retry_policy())
            })
            .collect();
        Ok(Self {
            rng: SmallRng::seed_from_u64(seed),
            cluster,
            clients,
            stats: VolumeSimStats::default(),
        })
    }

    pub fn cluster(&self) -> &Arc<FakeCluster> {
        &self.cluster
    }

    /// Run the simulation for a given number of rounds.
    pub async fn run(&mut self, rounds: u64) -> Result<(), SimulationError> {
        for round in 0..rounds {
            self.cluster.set_create_delay(self.rng.random_range(0..4));
            self.cluster.set_delete_delay(self.rng.random_range(0..4));
            let adders = self.rng.random_range(1..=MAX_ADDERS);
            self.execute_round(round, adders).await?;
            self.stats.rounds += 1;
        }
        Ok(())
    }

    /// Create, concurrently grow the ACL from `adders` clients, then delete.
    pub async fn execute_round(&mut self, round: u64, adders: usize) -> Result<(), SimulationError> {
        let ctx = CallContext::background().with_timeout(Duration::from_secs(30));
        let retries = AtomicU64::new(0);
        let name = format!("pvc-{round}");
        let spec = VolumeSpec {
            name: name.clone(),
            capacity: 1 << 30,
            replica_count: 2,
            compression: false,
            acl: Vec::new(),
            project_name: PROJECT.to_string(),
            snapshot_uuid: None,
        };

        let creator = &self.clients[0];
        let created = retry_transient(&retries, || creator.create_volume(&ctx, &spec, true)).await?;
        self.stats.creates += 1;
        // re-creating an existing identical volume adopts it
        let adopted = retry_transient(&retries, || creator.create_volume(&ctx, &spec, true)).await?;
        if adopted.uuid != created.uuid {
            return Err(SimulationError::Mismatch {
                context: format!("re-create of '{name}' returned {} instead of {}", adopted.uuid, created.uuid),
            });
        }
        self.check_single_volume(&name, VolumeState::Available)?;

        let hosts: Vec<String> = (0..adders).map(|i| format!("host-{i}")).collect();
        let uuid = created.uuid;
        let updates = self.clients[..adders].iter().zip(&hosts).map(|(client, host)| {
            let (ctx, retries) = (&ctx, &retries);
            async move {
                retry_transient(retries, move || {
                    client.update_volume(ctx, uuid, PROJECT, add_host(host))
                })
                .await
            }
        });
        for result in join_all(updates).await {
            result?;
        }
        self.stats.acl_updates += adders as u64;
        self.check_acl(uuid, &hosts)?;

        retry_transient(&retries, || creator.delete_volume(&ctx, uuid, PROJECT, true)).await?;
        self.stats.deletes += 1;
        self.check_deleted(&name)?;

        self.stats.transient_retries += retries.load(Ordering::Relaxed);
        Ok(())
    }

    fn check_single_volume(&self, name: &str, state: VolumeState) -> Result<(), SimulationError> {
        let found = self.cluster.volumes_named(name, PROJECT);
        match found.as_slice() {
            [vol] if vol.state == state => Ok(()),
            [vol] => Err(SimulationError::Mismatch {
                context: format!("volume '{name}' is {} instead of {state}", vol.state),
            }),
            _ => Err(SimulationError::Mismatch {
                context: format!("{} volumes named '{name}'", found.len()),
            }),
        }
    }

    fn check_acl(&self, uuid: Uuid, hosts: &[String]) -> Result<(), SimulationError> {
        let Some(vol) = self.cluster.volume(uuid) else {
            return Err(SimulationError::Mismatch {
                context: format!("volume {uuid} vanished during updates"),
            });
        };
        let expected = normalize_acl(hosts);
        if vol.acl != expected {
            return Err(SimulationError::Mismatch {
                context: format!("lost ACL update: have {:?}, want {expected:?}", vol.acl),
            });
        }
        Ok(())
    }

    fn check_deleted(&self, name: &str) -> Result<(), SimulationError> {
        let left = self.cluster.volumes_named(name, PROJECT);
        if left.iter().any(|v| v.state != VolumeState::Deleting) {
            return Err(SimulationError::Mismatch {
                context: format!("volume '{name}' still present after blocking delete"),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> &VolumeSimStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_host_drops_allow_none() {
        let vol = Volume {
            acl: vec![ACL_ALLOW_NONE.to_string()],
            ..Default::default()
        };
        let mut hook = add_host("host-B");
        let update = hook(&vol).unwrap().unwrap();
        assert_eq!(update.acl, Some(vec!["host-B".to_string()]));

        let vol = Volume {
            acl: vec!["host-A".to_string(), "host-B".to_string()],
            ..Default::default()
        };
        assert!(hook(&vol).unwrap().is_none());
    }

    #[tokio::test]
    async fn single_round_without_faults() {
        let mut harness = VolumeHarness::new(3, 0.0).unwrap();
        harness.cluster().set_create_delay(2);
        harness.cluster().set_delete_delay(2);
        harness.execute_round(0, 3).await.unwrap();
        assert_eq!(harness.stats().transient_retries, 0);
        assert_eq!(harness.stats().acl_updates, 3);
    }
}
