use std::collections::HashSet;
use std::sync::Barrier;
use std::time::Duration;

use resident_cache::{
    CancellationToken, Config, FrameReclaimer, HandleConfig, HandleState, LoadScheduler,
    ResourceCache, ResourceError,
};
use resident_test::{self as test, TestFactory, TestResource};
use tokio::runtime::Handle;

fn cache(config: &Config, factory: &TestFactory) -> ResourceCache<u32, TestResource> {
    let scheduler = LoadScheduler::new(&config.scheduler, Handle::current());
    let factory = factory.clone();
    ResourceCache::new(config, scheduler, FrameReclaimer::new(), move |_key: &u32| {
        factory.factory()
    })
}

#[tokio::test]
async fn test_lookup_creates_dead_placeholder() {
    test::setup();
    let factory = TestFactory::new();
    let cache = cache(&Config::default(), &factory);

    let first = cache.handle(&1).unwrap();
    let second = cache.handle(&1).unwrap();
    assert_eq!(first.instance_id(), second.instance_id());
    assert_eq!(first.name(), "1");
    assert_eq!(first.state(), HandleState::Dead);
    assert_eq!(cache.len(), 1);

    assert_eq!(cache.get(&2).unwrap().name(), "2");
    assert_eq!(cache.len(), 2);
    assert_eq!(factory.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_share_handle() {
    test::setup();
    let factory = TestFactory::new();
    let cache = cache(&Config::default(), &factory);

    let barrier = &Barrier::new(8);
    let cache = &cache;
    let ids: HashSet<_> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(move || {
                    barrier.wait();
                    cache.handle(&7).unwrap().instance_id()
                })
            })
            .collect();
        threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect()
    });
    assert_eq!(ids.len(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_maintain_evicts_queried_and_unused() {
    test::setup();
    let factory = TestFactory::new();
    let cache = cache(&Config::default(), &factory);

    let used = cache.get(&1).unwrap();
    let used_id = cache.handle(&1).unwrap().instance_id();
    let lease = used.rent(CancellationToken::new()).await.unwrap();
    let placeholder = cache.handle(&2).unwrap();

    // still leased
    assert_eq!(cache.maintain(), 0);

    drop(lease);
    assert_eq!(cache.maintain(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(factory.drops(), 1);

    // never queried, so it is kept
    assert_eq!(
        cache.handle(&2).unwrap().instance_id(),
        placeholder.instance_id()
    );
    assert_ne!(cache.handle(&1).unwrap().instance_id(), used_id);
}

#[tokio::test(start_paused = true)]
async fn test_maintain_keeps_self_referenced_handles() {
    test::setup();
    let config = Config {
        handles: HandleConfig {
            self_reference_window: Some(Duration::from_secs(2)),
            ..Default::default()
        },
        ..Default::default()
    };
    let factory = TestFactory::new();
    let cache = cache(&config, &factory);

    let handle = cache.handle(&1).unwrap();
    assert!(handle.try_get_immediate().available().is_none());
    handle.prefetch().unwrap();
    assert!(test::wait_until(|| handle.state() == HandleState::Alive).await);

    let resource = handle.try_get_immediate().available().unwrap();
    assert_eq!(resource.id, 1);
    drop(resource);
    cache.reclaimer().flush();
    assert_eq!(cache.maintain(), 0);
    assert_eq!(handle.ref_count(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    cache.reclaimer().flush();
    assert_eq!(cache.maintain(), 1);
    assert_eq!(handle.state(), HandleState::Dead);
    assert_eq!(factory.drops(), 1);
    assert!(cache.is_empty());
}

#[tokio::test]
#[allow(deprecated)]
async fn test_legacy_accessor_prevents_eviction() {
    test::setup();
    let factory = TestFactory::new();
    let cache = cache(&Config::default(), &factory);

    let handle = cache.handle(&1).unwrap();
    let accessor = handle.legacy_access();
    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(accessor.get().unwrap().id, lease.id);
    cache.reclaimer().flush();
    handle.release_self_reference(true);
    drop(lease);

    assert_eq!(cache.maintain(), 0);
    assert_eq!(handle.state(), HandleState::Dead);
    assert!(accessor.get().is_none());

    drop(accessor);
    assert_eq!(cache.maintain(), 1);
}

#[tokio::test]
async fn test_invalidate_keeps_referenced_handles_until_released() {
    test::setup();
    let factory = TestFactory::new();
    let cache = cache(&Config::default(), &factory);

    let old = cache.handle(&1).unwrap();
    let lease = old.rent(CancellationToken::new()).await.unwrap();
    let unused = cache.handle(&2).unwrap();

    cache.invalidate([&1, &2, &3]);
    assert!(cache.is_empty());
    assert_eq!(cache.handles_for_debug().len(), 1);

    let new = cache.handle(&1).unwrap();
    assert_ne!(new.instance_id(), old.instance_id());
    assert_ne!(cache.handle(&2).unwrap().instance_id(), unused.instance_id());

    // the old generation stays intact while it is leased
    assert_eq!(cache.maintain(), 0);
    assert_eq!(lease.id, 1);
    assert_eq!(old.state(), HandleState::Alive);
    assert_eq!(cache.handles_for_debug().len(), 3);

    drop(lease);
    assert_eq!(cache.maintain(), 1);
    assert_eq!(cache.handles_for_debug().len(), 2);
    assert_eq!(factory.drops(), 1);

    let fresh = new.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(fresh.id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_teardown() {
    test::setup();
    let config = Config {
        teardown_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let ready = TestFactory::new();
    let (stuck, _gate) = TestFactory::gated();
    let scheduler = LoadScheduler::new(&config.scheduler, Handle::current());
    let cache = {
        let ready = ready.clone();
        let stuck = stuck.clone();
        ResourceCache::new(&config, scheduler, FrameReclaimer::new(), move |key: &u32| {
            if *key == 2 {
                stuck.factory()
            } else {
                ready.factory()
            }
        })
    };

    let alive = cache.handle(&1).unwrap();
    let lease = alive.rent(CancellationToken::new()).await.unwrap();
    let loading = cache.handle(&2).unwrap();
    loading.add_ref().unwrap();
    assert!(test::wait_until(|| stuck.calls() == 1).await);

    cache.teardown().await;
    assert!(cache.is_torn_down());
    assert!(cache.is_empty());
    assert!(matches!(cache.handle(&1), Err(ResourceError::Disposed)));
    assert!(matches!(cache.get(&3), Err(ResourceError::Disposed)));

    // outstanding loads were cancelled once the timeout passed
    assert!(test::wait_until(|| stuck.cancelled() == 1).await);
    assert_eq!(loading.state(), HandleState::Faulted);

    // existing leases stay usable, but nothing can be revived
    assert_eq!(lease.id, 1);
    drop(lease);
    assert_eq!(ready.drops(), 1);
    assert!(matches!(alive.add_ref(), Err(ResourceError::Disposed)));

    loading.release().unwrap();
    assert!(matches!(
        loading.rent(CancellationToken::new()).await,
        Err(ResourceError::Disposed)
    ));

    // a second teardown has nothing left to do
    cache.teardown().await;
}
