use std::sync::{Arc, Barrier};
use std::time::Duration;

use resident_cache::{
    CancellationToken, FrameReclaimer, HandleConfig, HandleState, ImmediateResource,
    LoadScheduler, ResourceError,
};
use resident_test::{self as test, TestFactory};
use tokio::runtime::Handle;

fn scheduler(max_concurrency: usize) -> LoadScheduler {
    LoadScheduler::with_concurrency(max_concurrency, Handle::current())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_revival_creates_once() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                barrier.wait();
                handle.add_ref().unwrap();
            });
        }
    });
    assert_eq!(handle.ref_count(), 2);
    assert_eq!(handle.generation(), 1);

    let first = handle.rent(CancellationToken::new()).await.unwrap();
    let second = handle.rent(CancellationToken::new()).await.unwrap();
    assert!(Arc::ptr_eq(first.resource(), second.resource()));
    assert_eq!(factory.calls(), 1);

    drop((first, second));
    handle.release().unwrap();
    handle.release().unwrap();
    assert_eq!(handle.state(), HandleState::Dead);
    assert_eq!(factory.drops(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ref_count_matches_calls() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(4);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let threads = 8;
    let barrier = Barrier::new(threads);
    std::thread::scope(|s| {
        for thread in 0..threads {
            let handle = &handle;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..200 {
                    handle.add_ref().unwrap();
                    // every thread keeps `thread` references in the end
                    if i >= thread {
                        handle.release().unwrap();
                    }
                }
            });
        }
    });

    let expected: usize = (0..threads).sum();
    assert_eq!(handle.ref_count(), expected);
    // no generation ever ran more than one factory
    assert!(factory.calls() <= handle.generation() as usize);

    for _ in 0..expected {
        handle.release().unwrap();
    }
    assert_eq!(handle.ref_count(), 0);
    assert!(matches!(handle.release(), Err(ResourceError::Unreferenced)));
    assert_eq!(handle.ref_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_reference_keeps_single_generation() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(4);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );
    handle.add_ref().unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..500 {
                    handle.add_ref().unwrap();
                    handle.release().unwrap();
                }
            });
        }
    });

    assert_eq!(handle.generation(), 1);
    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(lease.id, 1);
    assert_eq!(factory.calls(), 1);
}

#[tokio::test]
async fn test_release_disposes_and_revival_starts_over() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(lease.id, 1);
    let first = Arc::clone(lease.resource());
    assert_eq!(lease.release().unwrap(), 0);
    assert_eq!(handle.state(), HandleState::Dead);
    // the generation let go of it, only our clone is left
    drop(first);
    assert_eq!(factory.drops(), 1);

    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(lease.id, 2);
    assert_eq!(handle.generation(), 2);
    assert_eq!(factory.calls(), 2);

    drop(lease);
    assert_eq!(factory.drops(), 2);
}

#[tokio::test]
async fn test_immediate_probe_while_loading_does_not_leak() {
    test::setup();
    let (factory, gate) = TestFactory::gated();
    let scheduler = scheduler(1);
    let reclaimer = FrameReclaimer::new();
    let handle = test::handle(&factory, &scheduler, &reclaimer, HandleConfig::default());

    handle.add_ref().unwrap();
    assert!(test::wait_until(|| factory.calls() == 1).await);
    assert_eq!(handle.state(), HandleState::Loading);

    assert!(matches!(
        handle.try_get_immediate(),
        ImmediateResource::Pending
    ));
    assert_eq!(handle.ref_count(), 1);
    assert!(reclaimer.is_empty());
    assert_eq!(handle.self_reference_expires_in(), Duration::ZERO);

    gate.open();
    assert!(test::wait_until(|| handle.state() == HandleState::Alive).await);

    let resource = handle.try_get_immediate().available().unwrap();
    assert_eq!(resource.id, 1);
    // our reference, the self-reference and the one for this unit of work
    assert_eq!(handle.ref_count(), 3);
    assert_eq!(reclaimer.flush(), 1);
    assert_eq!(handle.ref_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_probe_on_dead_handle_stays_dead() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(4);
    let reclaimer = FrameReclaimer::new();
    let handles: Vec<_> = (0..500)
        .map(|_| test::handle(&factory, &scheduler, &reclaimer, HandleConfig::default()))
        .collect();

    for handle in &handles {
        assert!(matches!(
            handle.try_get_immediate(),
            ImmediateResource::Pending
        ));
    }
    assert_eq!(reclaimer.flush(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.calls(), 0);
    assert_eq!(scheduler.stats().active, 0);
    assert_eq!(scheduler.stats().pending, 0);
    for handle in &handles {
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(handle.generation(), 0);
        assert_eq!(handle.state(), HandleState::Dead);
        assert_eq!(handle.self_reference_expires_in(), Duration::ZERO);
        assert!(handle.content_queried());
    }
}

#[tokio::test]
async fn test_faulted_generation_is_retried_after_release() {
    test::setup();
    let factory = TestFactory::new();
    factory.set_failing(true);
    let scheduler = scheduler(1);
    let reclaimer = FrameReclaimer::new();
    let handle = test::handle(&factory, &scheduler, &reclaimer, HandleConfig::default());

    handle.add_ref().unwrap();
    let err = handle.rent(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ResourceError::CreationFailed(_)));
    assert_eq!(handle.state(), HandleState::Faulted);

    // a faulted generation is not retried while it is referenced
    factory.set_failing(false);
    let err = handle.rent(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "resource creation failed: factory call 1 failed");
    assert!(matches!(
        handle.try_get_immediate(),
        ImmediateResource::Unavailable(ResourceError::CreationFailed(_))
    ));
    reclaimer.flush();
    handle.release_self_reference(true);
    assert_eq!(factory.calls(), 1);

    handle.release().unwrap();
    assert_eq!(handle.state(), HandleState::Dead);

    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(lease.id, 2);
    assert_eq!(handle.state(), HandleState::Alive);
}

#[tokio::test]
async fn test_rent_cancellation_releases() {
    test::setup();
    let (factory, _gate) = TestFactory::gated();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let cancellation = CancellationToken::new();
    let rent = handle.rent(cancellation.clone());
    let canceller = async {
        assert!(test::wait_until(|| factory.calls() == 1).await);
        cancellation.cancel();
    };
    let (result, ()) = futures::join!(rent, canceller);

    assert!(matches!(result, Err(ResourceError::Cancelled)));
    assert_eq!(handle.ref_count(), 0);
    assert_eq!(handle.state(), HandleState::Dead);
    // the final release cancelled the running factory
    assert!(test::wait_until(|| factory.cancelled() == 1).await);

    let already_cancelled = handle.rent(cancellation).await;
    assert!(matches!(already_cancelled, Err(ResourceError::Cancelled)));
    assert_eq!(handle.generation(), 1);
}

#[tokio::test]
async fn test_dropped_rent_releases() {
    test::setup();
    let (factory, _gate) = TestFactory::gated();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let result = tokio::time::timeout(
        Duration::from_millis(20),
        handle.rent(CancellationToken::new()),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(handle.ref_count(), 0);
    assert_eq!(handle.state(), HandleState::Dead);
}

#[tokio::test(start_paused = true)]
async fn test_rent_observes_cancellation_between_polls() {
    test::setup();
    let (factory, _gate) = TestFactory::gated();
    let scheduler = scheduler(1);
    let config = HandleConfig {
        rent_poll_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let handle = test::handle(&factory, &scheduler, &FrameReclaimer::new(), config);

    let cancellation = CancellationToken::new();
    let canceller = {
        let cancellation = cancellation.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancellation.cancel();
        }
    };
    let (result, ()) = futures::join!(handle.rent(cancellation), canceller);
    assert!(matches!(result, Err(ResourceError::Cancelled)));
    assert_eq!(handle.ref_count(), 0);
}

#[tokio::test]
async fn test_lease_releases_exactly_once() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let lease = handle.rent(CancellationToken::new()).await.unwrap();
    let cloned = lease.clone();
    assert_eq!(handle.ref_count(), 2);

    drop(lease);
    assert_eq!(handle.ref_count(), 1);
    assert_eq!(factory.drops(), 0);

    assert_eq!(cloned.release().unwrap(), 0);
    assert_eq!(factory.drops(), 1);
    assert!(matches!(handle.release(), Err(ResourceError::Unreferenced)));
}

#[tokio::test]
async fn test_ref_guard() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );

    let guard = handle.acquire().unwrap();
    let other = handle.acquire().unwrap();
    assert_eq!(handle.ref_count(), 2);
    assert_eq!(guard.release().unwrap(), 1);
    drop(other);
    assert_eq!(handle.ref_count(), 0);
    assert_eq!(handle.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_self_reference_lapses() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let reclaimer = FrameReclaimer::new();
    let config = HandleConfig {
        self_reference_window: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let handle = test::handle(&factory, &scheduler, &reclaimer, config);

    handle.prefetch().unwrap();
    assert_eq!(handle.ref_count(), 1);
    assert!(test::wait_until(|| handle.state() == HandleState::Alive).await);

    assert!(handle.try_get_immediate().is_available());
    reclaimer.flush();
    assert_eq!(handle.ref_count(), 1);
    assert!(handle.self_reference_expires_in() > Duration::from_millis(1900));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(handle.release_self_reference(false), 1);

    tokio::time::advance(Duration::from_millis(1500)).await;
    assert_eq!(handle.release_self_reference(false), 0);
    assert_eq!(handle.state(), HandleState::Dead);
    assert_eq!(factory.drops(), 1);

    // nothing left to drop
    assert_eq!(handle.release_self_reference(true), 0);
}

#[tokio::test]
async fn test_infinite_self_reference() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let config = HandleConfig {
        self_reference_window: None,
        ..Default::default()
    };
    let handle = test::handle(&factory, &scheduler, &FrameReclaimer::new(), config);

    handle.prefetch().unwrap();
    handle.prefetch().unwrap();
    assert_eq!(handle.ref_count(), 1);
    assert_eq!(handle.self_reference_expires_in(), Duration::MAX);
    assert_eq!(handle.release_self_reference(false), 1);
    assert_eq!(handle.release_self_reference(true), 0);
}

#[tokio::test]
async fn test_public_view() {
    test::setup();
    let factory = TestFactory::new();
    let scheduler = scheduler(1);
    let handle = test::handle(
        &factory,
        &scheduler,
        &FrameReclaimer::new(),
        HandleConfig::default(),
    );
    let public = handle.public();
    assert_eq!(public.name(), "test");

    let lease = public.rent(CancellationToken::new()).await.unwrap();
    assert_eq!(public.state(), HandleState::Alive);
    assert_eq!(lease.id, 1);
    assert_eq!(lease.handle().unwrap().instance_id(), handle.instance_id());
}
