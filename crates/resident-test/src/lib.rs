//! Helpers for testing resident caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - A [`TestFactory`] counts its invocations and the drops of the resources it produced. Clone
//!    it before handing its [`factory`](TestFactory::factory) to a handle or cache, and keep the
//!    clone around for assertions.
//!
//!  - A gated factory does not complete until its [`Gate`] lets it through. Open the gate before
//!    the end of the test, otherwise pending factories are only cancelled when their generation is
//!    released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resident_cache::{
    FrameReclaimer, HandleConfig, LoadScheduler, ResourceFactory, SharedResourceHandle,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resident_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resident_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A resource that counts how often it was dropped.
#[derive(Debug)]
pub struct TestResource {
    /// The factory call that produced this resource, starting at 1.
    pub id: usize,
    drops: Arc<AtomicUsize>,
}

impl Drop for TestResource {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds gated factories until they are let through.
#[derive(Clone, Debug)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
}

impl Gate {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(0)),
        }
    }

    /// Lets `n` waiting (or future) factory calls through.
    pub fn release(&self, n: usize) {
        self.semaphore.add_permits(n);
    }

    /// Lets every current and future factory call through.
    pub fn open(&self) {
        self.semaphore.close();
    }

    async fn pass(&self) {
        // A closed semaphore means the gate is open.
        if let Ok(permit) = self.semaphore.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    calls: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    drops: Arc<AtomicUsize>,
    fail: AtomicBool,
}

/// A resource factory for tests.
///
/// Counts calls, completions, cancellations and concurrently running calls. Can be made to fail,
/// to take a while, or to wait on a [`Gate`].
#[derive(Clone, Debug, Default)]
pub struct TestFactory {
    state: Arc<FactoryState>,
    gate: Option<Gate>,
    delay: Option<Duration>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose calls wait on the returned gate.
    pub fn gated() -> (Self, Gate) {
        let gate = Gate::new();
        let factory = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (factory, gate)
    }

    /// Makes every call take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every following call fail, or succeed again.
    pub fn set_failing(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    /// The number of times the factory was invoked.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// The number of calls that produced a resource.
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// The number of calls that observed their cancellation token.
    pub fn cancelled(&self) -> usize {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// The highest number of calls that were running at the same time.
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    /// The number of produced resources that have been dropped.
    pub fn drops(&self) -> usize {
        self.state.drops.load(Ordering::SeqCst)
    }

    /// Produces one resource.
    pub async fn create(self, cancellation: CancellationToken) -> anyhow::Result<TestResource> {
        let state = &self.state;
        let id = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);

        let work = async {
            if let Some(gate) = &self.gate {
                gate.pass().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        };
        let finished = tokio::select! {
            _ = work => true,
            _ = cancellation.cancelled() => false,
        };
        state.active.fetch_sub(1, Ordering::SeqCst);

        if !finished {
            state.cancelled.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("factory call {id} was cancelled");
        }
        if state.fail.load(Ordering::SeqCst) {
            anyhow::bail!("factory call {id} failed");
        }
        state.completed.fetch_add(1, Ordering::SeqCst);
        Ok(TestResource {
            id,
            drops: state.drops.clone(),
        })
    }

    /// The factory as it is handed to handles and caches.
    pub fn factory(&self) -> Arc<dyn ResourceFactory<TestResource>> {
        let this = self.clone();
        Arc::new(move |cancellation: CancellationToken| this.clone().create(cancellation))
    }
}

/// Creates a standalone handle backed by `factory`.
pub fn handle(
    factory: &TestFactory,
    scheduler: &LoadScheduler,
    reclaimer: &FrameReclaimer,
    config: HandleConfig,
) -> SharedResourceHandle<TestResource> {
    SharedResourceHandle::new(
        "test",
        factory.factory(),
        scheduler.clone(),
        reclaimer.clone(),
        config,
    )
}

/// Yields to the runtime until `condition` holds, giving up after a while.
///
/// Returns whether the condition was met.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}
