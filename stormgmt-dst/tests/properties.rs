//! End-to-end properties of the pool and the volume lifecycle, run against
//! the in-memory cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stormgmt::{
    ACL_ALLOW_NONE, CallContext, Client, ClientPool, EndpointSet, Error, ManagementApi,
    MgmtScheme, PoolOptions, Volume, VolumeProtection, VolumeSpec, VolumeState, VolumeUpdate,
    new_client_id,
};
use stormgmt_dst::{BLOCK_FOREVER_PORT, FakeCluster, FakeDialer, Op, fast_retry_policy};
use uuid::Uuid;

fn targets(items: &[&str]) -> EndpointSet {
    EndpointSet::parse(items).unwrap()
}

fn fast_pool(dialer: &FakeDialer) -> ClientPool<Client> {
    let opts = PoolOptions {
        dial_timeout: Duration::from_secs(2),
        linger_time: Duration::from_millis(20),
        reap_cycle: Duration::from_millis(5),
    };
    ClientPool::new(opts, dialer.dial_fn())
}

fn client(cluster: &Arc<FakeCluster>) -> Client {
    let api: Arc<dyn ManagementApi> = cluster.clone();
    Client::with_retry(
        new_client_id(),
        targets(&["10.0.0.1:80"]),
        api,
        fast_retry_policy(),
    )
}

fn available_volume(acl: &[&str]) -> Volume {
    Volume {
        name: "pvc-1".to_string(),
        uuid: Uuid::new_v4(),
        replica_count: 2,
        capacity: 1 << 30,
        acl: acl.iter().map(|s| s.to_string()).collect(),
        state: VolumeState::Available,
        protection: VolumeProtection::Protected,
        project_name: "p".to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_share_one_dial() {
    let dialer = FakeDialer::new(1, Arc::new(FakeCluster::new(1)));
    let pool = fast_pool(&dialer);
    let eps = targets(&["10.0.0.1:80", "10.0.0.2:80"]);
    let ctx = CallContext::background();

    let (a, b) = tokio::join!(
        pool.get_client(&ctx, &eps, MgmtScheme::Grpc),
        pool.get_client(&ctx, &eps, MgmtScheme::Grpc)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id(), b.id());
    assert_eq!(dialer.dials(), 1);
    assert_eq!(pool.use_count(&a), Some(2));

    pool.put_client(b);
    pool.put_client(a.clone());
    assert_eq!(pool.use_count(&a), Some(0));
    pool.close().await;
}

#[tokio::test]
async fn distinct_targets_get_distinct_clients() {
    let dialer = FakeDialer::new(2, Arc::new(FakeCluster::new(2)));
    let pool = fast_pool(&dialer);
    let ctx = CallContext::background();

    let a = pool
        .get_client(&ctx, &targets(&["10.0.0.1:80"]), MgmtScheme::Grpc)
        .await
        .unwrap();
    let b = pool
        .get_client(&ctx, &targets(&["10.0.0.2:80"]), MgmtScheme::Grpc)
        .await
        .unwrap();
    assert_ne!(a.id(), b.id());
    pool.put_client(a);
    pool.put_client(b);
    pool.close().await;
}

#[tokio::test]
async fn blocked_dial_honors_caller_deadline() {
    let dialer = FakeDialer::new(3, Arc::new(FakeCluster::new(3)));
    let pool = ClientPool::new(PoolOptions::default(), dialer.dial_fn());
    let blocked = format!("10.0.0.1:{BLOCK_FOREVER_PORT}");
    let eps = targets(&[blocked.as_str()]);
    let ctx = CallContext::background().with_timeout(Duration::from_millis(250));

    let start = Instant::now();
    let err = pool
        .get_client(&ctx, &eps, MgmtScheme::Grpc)
        .await
        .unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, Error::DeadlineExceeded(_)), "{err:?}");
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    assert_eq!(pool.stats().live, 0);

    pool.close().await;
    assert_eq!(dialer.clients(), 0);
}

#[tokio::test]
async fn cancelled_waiter_leaves_others_waiting() {
    let dialer = FakeDialer::new(4, Arc::new(FakeCluster::new(4)));
    let opts = PoolOptions {
        dial_timeout: Duration::from_millis(300),
        ..PoolOptions::default()
    };
    let pool = ClientPool::new(opts, dialer.dial_fn());
    let blocked = format!("10.0.0.1:{BLOCK_FOREVER_PORT}");
    let eps = targets(&[blocked.as_str()]);
    let impatient = CallContext::background().with_timeout(Duration::from_millis(50));
    let patient = CallContext::background();

    let start = Instant::now();
    let (short, long) = tokio::join!(
        async {
            let r = pool.get_client(&impatient, &eps, MgmtScheme::Grpc).await;
            (r, start.elapsed())
        },
        async {
            let r = pool.get_client(&patient, &eps, MgmtScheme::Grpc).await;
            (r, start.elapsed())
        }
    );
    assert!(matches!(short.0, Err(Error::DeadlineExceeded(_))));
    assert!(short.1 < Duration::from_millis(250), "{:?}", short.1);
    // the patient waiter only gives up when the shared dial times out
    assert!(matches!(long.0, Err(Error::DeadlineExceeded(_))));
    assert!(long.1 >= Duration::from_millis(250), "{:?}", long.1);
    assert_eq!(dialer.dials(), 1);
    pool.close().await;
}

#[tokio::test]
async fn lingering_client_is_replaced_after_expiry() {
    let cluster = Arc::new(FakeCluster::new(5));
    let dialer = FakeDialer::new(5, cluster.clone());
    let pool = fast_pool(&dialer);
    let eps = targets(&["10.0.0.1:80"]);
    let ctx = CallContext::background();

    let first = pool.get_client(&ctx, &eps, MgmtScheme::Grpc).await.unwrap();
    let first_id = first.id().to_string();
    pool.put_client(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.closes(), 1);

    let second = pool.get_client(&ctx, &eps, MgmtScheme::Grpc).await.unwrap();
    assert_ne!(second.id(), first_id);
    pool.put_client(second);
    pool.close().await;
}

#[tokio::test]
async fn close_empties_the_pool() {
    let cluster = Arc::new(FakeCluster::new(6));
    let dialer = FakeDialer::new(6, cluster.clone());
    let pool = fast_pool(&dialer);
    let ctx = CallContext::background();

    let held = pool
        .get_client(&ctx, &targets(&["10.0.0.1:80"]), MgmtScheme::Grpc)
        .await
        .unwrap();
    let idle = pool
        .get_client(&ctx, &targets(&["10.0.0.2:80"]), MgmtScheme::Grpc)
        .await
        .unwrap();
    pool.put_client(idle);

    pool.close().await;
    let stats = pool.stats();
    assert_eq!((stats.members, stats.live), (0, 0));
    assert_eq!(cluster.closes(), 2);
    // returning after close is ignored
    pool.put_client(held);
}

#[tokio::test]
async fn create_volume_twice_is_idempotent() {
    let cluster = Arc::new(FakeCluster::new(7));
    let client = client(&cluster);
    let ctx = CallContext::background();
    let spec = VolumeSpec {
        name: "pvc-1".to_string(),
        capacity: 1 << 30,
        replica_count: 2,
        compression: false,
        acl: vec!["host-A".to_string()],
        project_name: "p".to_string(),
        snapshot_uuid: None,
    };

    let first = client.create_volume(&ctx, &spec, true).await.unwrap();
    let second = client.create_volume(&ctx, &spec, true).await.unwrap();
    assert_eq!(first.uuid, second.uuid);
    assert_eq!(cluster.calls(Op::CreateVolume), 1);
}

#[tokio::test]
async fn update_without_change_never_writes() {
    let cluster = Arc::new(FakeCluster::new(8));
    let vol = cluster.insert_volume(available_volume(&["host-A"]));
    let client = client(&cluster);
    let ctx = CallContext::background();

    let got = client
        .update_volume(&ctx, vol.uuid, "p", |_: &Volume| Ok(None))
        .await
        .unwrap();
    assert_eq!(got, vol);
    assert_eq!(cluster.calls(Op::UpdateVolume), 0);
    assert_eq!(cluster.calls(Op::GetVolume), 1);
}

#[tokio::test]
async fn acl_update_writes_once() {
    let cluster = Arc::new(FakeCluster::new(9));
    let vol = cluster.insert_volume(available_volume(&[ACL_ALLOW_NONE]));
    let client = client(&cluster);
    let ctx = CallContext::background();
    let wanted = vec!["host-A".to_string()];

    let got = client
        .update_volume(&ctx, vol.uuid, "p", |v: &Volume| {
            if v.acl == wanted {
                return Ok(None);
            }
            Ok(Some(VolumeUpdate {
                acl: Some(wanted.clone()),
                ..Default::default()
            }))
        })
        .await
        .unwrap();
    assert_eq!(got.acl, wanted);
    assert_eq!(cluster.calls(Op::UpdateVolume), 1);
    // one fetch before the write, one to confirm it
    assert_eq!(cluster.calls(Op::GetVolume), 2);
}

#[tokio::test]
async fn deleting_missing_volume_issues_no_delete() {
    let cluster = Arc::new(FakeCluster::new(10));
    let client = client(&cluster);
    let ctx = CallContext::background();

    client
        .delete_volume(&ctx, Uuid::new_v4(), "p", true)
        .await
        .unwrap();
    assert_eq!(cluster.calls(Op::GetVolume), 1);
    assert_eq!(cluster.calls(Op::DeleteVolume), 0);
}
