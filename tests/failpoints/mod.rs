mod consistency;

use consistency::verify_consistency;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use vcache::config::Settings;
use vcache::failpoints as fp;
use vcache::memfs::{MemAttrs, MemFs, ROOT_INO};
use vcache::vnode::{FreeListKind, VType, VnodeFlags};
use vcache::{Mount, VnodeCache, VnodeError};

/// A started cache with one in-memory mount, torn down with the scenario.
struct TestContext {
    cache: Arc<VnodeCache<MemFs>>,
    mount: Arc<Mount<MemFs>>,
}

impl TestContext {
    fn new() -> (fail::FailScenario<'static>, Self) {
        let scenario = fail::FailScenario::setup();
        let cache = VnodeCache::new(&Settings::default());
        cache.start();
        let mount = Mount::new(MemFs::new());
        (scenario, Self { cache, mount })
    }

    fn file(&self) -> [u8; 8] {
        MemFs::key(self.mount.driver().mknod(VType::Reg, None))
    }

    async fn assert_consistent(&self) {
        let report = verify_consistency(&self.cache).await.unwrap();
        assert!(report.errors.is_empty(), "consistency errors: {:?}", report.errors);
    }

    async fn finish(self) {
        self.assert_consistent().await;
        self.cache.shutdown().await;
    }
}

#[tokio::test]
async fn test_consistent_after_plain_workload() {
    let (_scenario, ctx) = TestContext::new();
    let keys: Vec<_> = (0..20).map(|_| ctx.file()).collect();

    let mut held = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        let handle = ctx.cache.get(&ctx.mount, key).await.unwrap();
        if i % 3 == 0 {
            ctx.cache.hold(&handle);
        }
        if i % 2 == 0 {
            held.push(handle);
        } else {
            drop(handle);
        }
    }
    ctx.assert_consistent().await;

    for handle in held {
        handle.release().await;
    }
    ctx.cache.drain_to(5).await.unwrap();
    assert_eq!(ctx.cache.numvnodes(), 5);
    ctx.finish().await;
}

#[tokio::test]
async fn test_failed_load_leaves_nothing_behind() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();

    fail::cfg(fp::LOAD_AFTER_DRIVER, "return").unwrap();
    let err = ctx.cache.get(&ctx.mount, &key).await.unwrap_err();
    assert!(matches!(err, VnodeError::Driver(_)));
    fail::cfg(fp::LOAD_AFTER_DRIVER, "off").unwrap();

    assert_eq!(ctx.cache.cached(), 0);
    assert_eq!(ctx.cache.numvnodes(), 0);
    assert_eq!(ctx.mount.busy_count(), 0);
    assert_eq!(ctx.cache.stats().load_failures, 1);

    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    handle.release().await;
    ctx.finish().await;
}

#[tokio::test]
async fn test_panicking_loader_unwinds_cleanly() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();

    fail::cfg(fp::LOAD_BEFORE_DRIVER, "panic").unwrap();
    let task = {
        let cache = Arc::clone(&ctx.cache);
        let mount = Arc::clone(&ctx.mount);
        tokio::spawn(async move { cache.get(&mount, &key).await.map(|_| ()) })
    };
    let result = task.await;
    assert!(result.is_err() && result.unwrap_err().is_panic());
    fail::cfg(fp::LOAD_BEFORE_DRIVER, "off").unwrap();

    assert_eq!(ctx.cache.cached(), 0);
    assert_eq!(ctx.cache.numvnodes(), 0);
    assert_eq!(ctx.mount.busy_count(), 0);

    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    assert_eq!(ctx.mount.driver().loads(), 1);
    handle.release().await;
    ctx.finish().await;
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let (_scenario, ctx) = TestContext::new();
    let root = ctx.cache.get(&ctx.mount, &MemFs::key(ROOT_INO)).await.unwrap();

    fail::cfg(fp::CREATE_BEFORE_DRIVER, "return").unwrap();
    assert!(ctx.cache.create(&ctx.mount, &root, &MemAttrs::file()).await.is_err());
    fail::cfg(fp::CREATE_BEFORE_DRIVER, "off").unwrap();

    assert_eq!(ctx.cache.numvnodes(), 1);
    assert_eq!(ctx.mount.driver().creates(), 0);

    let created = ctx.cache.create(&ctx.mount, &root, &MemAttrs::file()).await.unwrap();
    created.release().await;
    root.release().await;
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reference_taken_during_deactivate_aborts_cleanup() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    let vnode = Arc::clone(handle.vnode());

    fail::cfg(fp::RELEASE_BEFORE_DEACTIVATE, "sleep(200)").unwrap();
    let releaser = tokio::spawn(async move { handle.release().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let again = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    releaser.await.unwrap();
    fail::cfg(fp::RELEASE_BEFORE_DEACTIVATE, "off").unwrap();

    assert!(Arc::ptr_eq(again.vnode(), &vnode));
    assert_eq!(vnode.use_count(), 1);
    assert_eq!(vnode.free_list(), None);
    assert!(!vnode.is_clean());
    ctx.assert_consistent().await;

    again.release().await;
    assert_eq!(vnode.free_list(), Some(FreeListKind::NoHold));
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_get_during_drain_reclaim_never_sees_dying_vnode() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    let victim = Arc::clone(handle.vnode());
    handle.release().await;

    fail::cfg(fp::RECLAIM_AFTER_XLOCK, "sleep(200)").unwrap();
    let drainer = {
        let cache = Arc::clone(&ctx.cache);
        tokio::spawn(async move { cache.drain_to(0).await })
    };
    while !victim.flags().contains(VnodeFlags::XLOCK) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    match ctx.cache.get(&ctx.mount, &key).await {
        Err(VnodeError::NotFound) => {}
        Ok(fresh) => {
            assert!(!Arc::ptr_eq(fresh.vnode(), &victim));
            fresh.release().await;
        }
        Err(e) => panic!("unexpected error: {e}"),
    }
    drainer.await.unwrap().unwrap();
    fail::cfg(fp::RECLAIM_AFTER_XLOCK, "off").unwrap();

    assert!(victim.is_clean());
    assert_eq!(victim.use_count(), 0);
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_victim_referenced_before_reclaim_survives() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    ctx.cache.get(&ctx.mount, &key).await.unwrap().release().await;

    fail::cfg(fp::DRAIN_AFTER_VICTIM, "sleep(200)").unwrap();
    let drainer = {
        let cache = Arc::clone(&ctx.cache);
        tokio::spawn(async move { cache.drain_to(0).await })
    };
    while ctx.cache.free_count(FreeListKind::NoHold) > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    // nothing left to take once the victim was handed back
    assert!(matches!(drainer.await.unwrap(), Err(VnodeError::Busy)));
    fail::cfg(fp::DRAIN_AFTER_VICTIM, "off").unwrap();

    assert!(!handle.is_clean());
    assert_eq!(handle.use_count(), 1);
    assert_eq!(ctx.mount.driver().reclaims(), 0);
    handle.release().await;
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_check_while_reclaiming() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    let vnode = Arc::clone(handle.vnode());
    assert!(vnode.dead_check(false).await.is_ok());

    fail::cfg(fp::RECLAIM_AFTER_INVALIDATE, "sleep(200)").unwrap();
    let reclaimer = {
        let cache = Arc::clone(&ctx.cache);
        tokio::spawn(async move { cache.gone(handle).await })
    };
    while !vnode.flags().contains(VnodeFlags::XLOCK) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(vnode.dead_check(false).await, Err(VnodeError::Busy)));
    assert!(matches!(vnode.dead_check(true).await, Err(VnodeError::NotFound)));
    reclaimer.await.unwrap();
    fail::cfg(fp::RECLAIM_AFTER_INVALIDATE, "off").unwrap();

    assert_eq!(ctx.cache.numvnodes(), 0);
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookup_during_drain_reclaim_keeps_new_threshold() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    let handle = ctx.cache.get(&ctx.mount, &key).await.unwrap();
    let victim = Arc::clone(handle.vnode());
    handle.release().await;

    fail::cfg(fp::RECLAIM_AFTER_XLOCK, "sleep(200)").unwrap();
    let resize = {
        let cache = Arc::clone(&ctx.cache);
        tokio::spawn(async move { cache.set_desired_vnodes(0).await })
    };
    while !victim.flags().contains(VnodeFlags::XLOCK) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let lookup = {
        let cache = Arc::clone(&ctx.cache);
        let mount = Arc::clone(&ctx.mount);
        tokio::spawn(async move { cache.get(&mount, &key).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // the waiting lookup holds no reference on the dying vnode
    assert_eq!(victim.use_count(), 1);

    assert!(matches!(lookup.await.unwrap(), Err(VnodeError::NotFound)));
    resize.await.unwrap().unwrap();
    fail::cfg(fp::RECLAIM_AFTER_XLOCK, "off").unwrap();

    assert_eq!(ctx.cache.desired_vnodes(), 0);
    assert_eq!(ctx.cache.numvnodes(), 0);
    assert!(victim.is_clean());
    ctx.finish().await;
}

async fn mixed_op(
    cache: &Arc<VnodeCache<MemFs>>,
    mount: &Arc<Mount<MemFs>>,
    key: &[u8],
    roll: u32,
) -> Result<(), VnodeError> {
    match roll {
        0..40 => cache.get(mount, key).await?.release().await,
        40..55 => drop(cache.get(mount, key).await?),
        55..65 => {
            let handle = cache.get(mount, key).await?;
            cache.hold(&handle);
            tokio::task::yield_now().await;
            cache.hold_release(&handle);
            handle.release().await;
        }
        65..75 => {
            let handle = cache.get(mount, key).await?;
            cache.gone(handle).await;
        }
        75..85 => {
            let handle = cache.get(mount, key).await?;
            cache.recycle(handle).await;
        }
        85..95 => cache.get_nowait(mount, key).await?.release_nonblocking(),
        _ => cache.drain_to(4).await?,
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consistent_after_concurrent_mixed_workload() {
    let (_scenario, ctx) = TestContext::new();
    let keys: Arc<Vec<[u8; 8]>> = Arc::new((0..16).map(|_| ctx.file()).collect());

    let workers: Vec<_> = (0..8u64)
        .map(|seed| {
            let cache = Arc::clone(&ctx.cache);
            let mount = Arc::clone(&ctx.mount);
            let keys = Arc::clone(&keys);
            tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..300 {
                    let key = keys[rng.gen_range(0..keys.len())];
                    let roll = rng.gen_range(0..100);
                    match mixed_op(&cache, &mount, &key, roll).await {
                        Ok(()) | Err(VnodeError::Busy) | Err(VnodeError::NotFound) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();
    for result in futures::future::join_all(workers).await {
        result.unwrap();
    }

    ctx.assert_consistent().await;
    assert_eq!(ctx.mount.busy_count(), 0);
    let stats = ctx.cache.stats();
    assert_eq!(stats.allocated - stats.destroyed, ctx.cache.numvnodes() as u64);

    ctx.cache.drain_to(0).await.unwrap();
    assert_eq!(ctx.cache.cached(), 0);
    ctx.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_waits_for_victim_taken_elsewhere() {
    let (_scenario, ctx) = TestContext::new();
    let key = ctx.file();
    ctx.cache.get(&ctx.mount, &key).await.unwrap().release().await;

    fail::cfg(fp::DRAIN_AFTER_VICTIM, "sleep(200)").unwrap();
    let first = {
        let cache = Arc::clone(&ctx.cache);
        tokio::spawn(async move { cache.drain_to(0).await })
    };
    while ctx.cache.free_count(FreeListKind::NoHold) > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // nothing is left on the free lists, but the victim in flight gets there
    ctx.cache.drain_to(0).await.unwrap();
    first.await.unwrap().unwrap();
    fail::cfg(fp::DRAIN_AFTER_VICTIM, "off").unwrap();

    assert_eq!(ctx.cache.numvnodes(), 0);
    assert_eq!(ctx.mount.driver().reclaims(), 1);
    ctx.finish().await;
}
