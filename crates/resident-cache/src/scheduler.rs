//! Bounded concurrency execution of resource factories.
//!
//! The [`LoadScheduler`] keeps a list of pending work items and a count of active ones. Whenever an
//! item is submitted or an active item finishes, the scheduler moves the highest priority pending
//! items into the active set until the concurrency limit is reached.
//!
//! Priority is a total order, evaluated live on every pass:
//!
//! 1. Cancelled pending items are pruned without ever running their factory.
//! 2. Explicit items outrank opportunistic ones.
//! 3. Among opportunistic items, the most recently requested one wins.
//! 4. Among explicit items, the one that was requested first wins.
//!
//! Remaining ties are broken by submission order, so selection is reproducible.

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, Tick};
use crate::config::SchedulerConfig;
use crate::error::ResourceError;
use crate::utils::{CallOnDrop, MeasureGuard, lock};

/// The outcome of one factory invocation.
pub type LoadResult<R> = Result<Arc<R>, ResourceError>;

/// The completion future of a submitted work item.
///
/// Every clone of this future observes the same outcome.
pub type LoadFuture<R> = Shared<BoxFuture<'static, LoadResult<R>>>;

/// The metadata used to prioritize a pending work item.
///
/// The scheduler reads the basis again on every selection pass, so an implementation may change
/// its answers while the item is queued, e.g. when a speculative request becomes an explicit one.
pub trait LoadBasis: Send + Sync + 'static {
    /// Whether the request is speculative.
    fn is_opportunistic(&self) -> bool;

    /// When the resource was first requested.
    fn first_requested_tick(&self) -> Tick;

    /// When the resource was most recently requested.
    fn latest_requested_tick(&self) -> Tick;
}

/// A [`LoadBasis`] that never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedBasis {
    pub opportunistic: bool,
    pub first_requested: Tick,
    pub latest_requested: Tick,
}

impl FixedBasis {
    /// An explicit request made at `tick`.
    pub fn explicit(tick: Tick) -> Self {
        Self {
            opportunistic: false,
            first_requested: tick,
            latest_requested: tick,
        }
    }

    /// A speculative request made at `tick`.
    pub fn opportunistic(tick: Tick) -> Self {
        Self {
            opportunistic: true,
            first_requested: tick,
            latest_requested: tick,
        }
    }
}

impl LoadBasis for FixedBasis {
    fn is_opportunistic(&self) -> bool {
        self.opportunistic
    }

    fn first_requested_tick(&self) -> Tick {
        self.first_requested
    }

    fn latest_requested_tick(&self) -> Tick {
        self.latest_requested
    }
}

/// A point-in-time view of the scheduler's queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub active: usize,
    pub max_concurrency: usize,
}

/// Type-erased factory invocation. Resolves to the status used for metrics.
type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, &'static str> + Send>;

struct WorkItem {
    basis: Arc<dyn LoadBasis>,
    cancellation: CancellationToken,
    sequence: u64,
    submitted: Instant,
    job: Job,
}

impl WorkItem {
    fn priority(&self) -> Priority {
        Priority {
            opportunistic: self.basis.is_opportunistic(),
            first_requested: self.basis.first_requested_tick(),
            latest_requested: self.basis.latest_requested_tick(),
            sequence: self.sequence,
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("priority", &self.priority())
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A snapshot of a work item's basis.
///
/// Ordered so that the item to run next is the minimum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Priority {
    opportunistic: bool,
    first_requested: Tick,
    latest_requested: Tick,
    sequence: u64,
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.opportunistic, other.opportunistic) {
            (false, true) => Ordering::Less,
            (true, false) => Ordering::Greater,
            // freshest speculative request first
            (true, true) => other
                .latest_requested
                .cmp(&self.latest_requested)
                .then_with(|| other.sequence.cmp(&self.sequence)),
            // oldest explicit request first
            (false, false) => self
                .first_requested
                .cmp(&other.first_requested)
                .then_with(|| self.sequence.cmp(&other.sequence)),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<WorkItem>,
    active: usize,
    closed: bool,
    next_sequence: u64,
}

impl QueueState {
    /// Removes every cancelled pending item into `pruned`.
    fn prune_cancelled(&mut self, pruned: &mut Vec<WorkItem>) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].cancellation.is_cancelled() {
                pruned.push(self.pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }

    /// Removes and returns the pending item that should run next.
    ///
    /// Cancelled items encountered along the way are moved into `pruned`.
    fn extract_highest_priority(&mut self, pruned: &mut Vec<WorkItem>) -> Option<WorkItem> {
        self.prune_cancelled(pruned);

        let (best, _) = self
            .pending
            .iter()
            .enumerate()
            .map(|(idx, item)| (idx, item.priority()))
            .min_by(|(_, a), (_, b)| a.cmp(b))?;

        Some(self.pending.swap_remove(best))
    }
}

struct SchedulerInner {
    state: Mutex<QueueState>,
    max_concurrency: usize,
    clock: Clock,
    runtime: Handle,
    /// Cancelled when shutdown runs out of grace time.
    force_cancel: CancellationToken,
    /// Notified whenever the last active item finishes.
    idle: Notify,
}

impl SchedulerInner {
    /// Starts as many pending items as the concurrency limit allows.
    fn pump(self: &Arc<Self>) {
        let mut pruned = Vec::new();
        let mut started = Vec::new();
        let (pending, active) = {
            let mut state = lock(&self.state);
            while state.active < self.max_concurrency {
                match state.extract_highest_priority(&mut pruned) {
                    Some(item) => {
                        state.active += 1;
                        started.push(item);
                    }
                    None => break,
                }
            }
            if state.active >= self.max_concurrency {
                state.prune_cancelled(&mut pruned);
            }
            (state.pending.len(), state.active)
        };

        if !pruned.is_empty() {
            tracing::trace!(count = pruned.len(), "Pruned cancelled work items");
            metric!(counter("scheduler.pruned") += pruned.len() as i64);
            // Dropping the job resolves the item's future as cancelled.
            drop(pruned);
        }
        metric!(gauge("scheduler.pending") = pending as u64);
        metric!(gauge("scheduler.active") = active as u64);

        for item in started {
            self.start(item);
        }
    }

    fn start(self: &Arc<Self>, item: WorkItem) {
        let WorkItem {
            cancellation,
            submitted,
            job,
            sequence,
            ..
        } = item;
        metric!(timer("scheduler.wait_time") = submitted.elapsed());

        let inner = Arc::clone(self);
        // Created outside the task, so the slot is freed even if the task is never polled.
        let finish = CallOnDrop::new(move || inner.finish());
        let force_cancel = self.force_cancel.clone();
        self.runtime.spawn(async move {
            let _finish = finish;
            let mut measure = MeasureGuard::start("scheduler");

            if cancellation.is_cancelled() {
                tracing::trace!(sequence, "Work item cancelled before it started");
                measure.done("pruned");
                return;
            }

            let status = tokio::select! {
                biased;
                _ = force_cancel.cancelled() => "force_cancelled",
                status = job(cancellation) => status,
            };
            measure.done(status);
        });
    }

    fn finish(self: &Arc<Self>) {
        let idle = {
            let mut state = lock(&self.state);
            state.active = state.active.saturating_sub(1);
            state.active == 0
        };
        if idle {
            self.idle.notify_waiters();
        }
        self.pump();
    }

    fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.active == 0 && state.pending.is_empty()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Runs resource factories with bounded concurrency.
///
/// This is a cheap handle that can be cloned and shared between caches.
#[derive(Clone)]
pub struct LoadScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for LoadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

impl LoadScheduler {
    /// Creates a new scheduler spawning its work onto `runtime`.
    pub fn new(config: &SchedulerConfig, runtime: Handle) -> Self {
        Self::with_concurrency(config.effective_concurrency(), runtime)
    }

    /// Creates a new scheduler with an explicit concurrency limit.
    pub fn with_concurrency(max_concurrency: usize, runtime: Handle) -> Self {
        let max_concurrency = max_concurrency.max(1);
        tracing::debug!(max_concurrency, "Creating load scheduler");
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(QueueState::default()),
                max_concurrency,
                clock: Clock::new(),
                runtime,
                force_cancel: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// The clock all request ticks submitted to this scheduler are measured with.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Enqueues a factory invocation and returns its completion future.
    ///
    /// This never blocks. The factory runs on the scheduler's runtime once the item is selected.
    /// If `cancellation` is cancelled before that happens, the factory is never invoked and the
    /// returned future resolves to [`ResourceError::Cancelled`]. Once the item has started,
    /// cancellation is up to the factory.
    ///
    /// A factory error or panic resolves the future to [`ResourceError::CreationFailed`]. After
    /// [`shutdown`](Self::shutdown), this immediately resolves to [`ResourceError::Disposed`].
    pub fn submit<R, F, Fut>(
        &self,
        basis: Arc<dyn LoadBasis>,
        factory: F,
        cancellation: CancellationToken,
    ) -> LoadFuture<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel::<LoadResult<R>>();

        let job: Job = Box::new(move |token| {
            async move {
                let outcome = AssertUnwindSafe(async move { factory(token).await })
                    .catch_unwind()
                    .await;
                let (result, status) = match outcome {
                    Ok(Ok(resource)) => (Ok(Arc::new(resource)), "ok"),
                    Ok(Err(err)) => (Err(ResourceError::creation_failed(err)), "err"),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "Resource factory panicked");
                        let err = anyhow::anyhow!("resource factory panicked: {message}");
                        (Err(ResourceError::creation_failed(err)), "panic")
                    }
                };
                if sender.send(result).is_err() {
                    tracing::trace!("Nobody is waiting for the resource any more, dropping it");
                }
                status
            }
            .boxed()
        });

        let completion = {
            let cancellation = cancellation.clone();
            async move {
                tokio::select! {
                    biased;
                    result = receiver => result.unwrap_or(Err(ResourceError::Cancelled)),
                    _ = cancellation.cancelled() => Err(ResourceError::Cancelled),
                }
            }
        };

        {
            let mut state = lock(&self.inner.state);
            if state.closed {
                drop(state);
                tracing::debug!("Rejecting submission to a scheduler that was shut down");
                return futures::future::ready(Err(ResourceError::Disposed))
                    .boxed()
                    .shared();
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.pending.push(WorkItem {
                basis,
                cancellation,
                sequence,
                submitted: Instant::now(),
                job,
            });
        }
        metric!(counter("scheduler.submitted") += 1);

        self.inner.pump();

        completion.boxed().shared()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = lock(&self.inner.state);
        SchedulerStats {
            pending: state.pending.len(),
            active: state.active,
            max_concurrency: self.inner.max_concurrency,
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Stops the scheduler.
    ///
    /// Further submissions are rejected, every pending item is dropped without running its
    /// factory, and active items get up to `grace` to finish before they are cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        let pending = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        tracing::info!(pending = pending.len(), "Shutting down load scheduler");
        drop(pending);
        metric!(gauge("scheduler.pending") = 0u64);

        if tokio::time::timeout(grace, self.inner.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                active = self.stats().active,
                "Load scheduler did not drain in time, cancelling active work"
            );
            self.inner.force_cancel.cancel();
            self.inner.wait_idle().await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
