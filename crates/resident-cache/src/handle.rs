//! The reference counted cache entry.
//!
//! A [`SharedResourceHandle`] owns at most one generation at a time. A generation begins with
//! the 0→1 transition of the reference count, which submits the handle's factory to the
//! [`LoadScheduler`], and ends with the 1→0 transition, which cancels the factory (if it has not
//! finished yet) and drops the produced resource.
//!
//! The reference count itself is only ever changed through a compare-and-swap loop that refuses
//! to touch a count of zero. Both revival and the final release take the narrow revive lock, and
//! a reviver that finds the count at zero while the previous generation has not been detached
//! yet waits for that to happen before starting a new one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::clock::Tick;
use crate::config::HandleConfig;
use crate::error::ResourceError;
use crate::legacy::AvailableOnAccess;
use crate::reclaimer::{FrameReclaimer, Releasable};
use crate::scheduler::{LoadBasis, LoadFuture, LoadScheduler};
use crate::utils::lock;

/// Self-reference expiry sentinel: no self-reference is held.
const EXPIRED: u64 = u64::MAX;
/// Self-reference expiry sentinel: the self-reference never lapses on its own.
const INFINITE: u64 = u64::MAX - 1;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produces the resource of a [`SharedResourceHandle`].
///
/// The factory is invoked once per generation, on the scheduler's runtime. It should observe the
/// given cancellation token, which is cancelled as soon as the generation is released.
///
/// This is implemented for every `Fn(CancellationToken) -> impl Future<Output = anyhow::Result<R>>`.
pub trait ResourceFactory<R>: Send + Sync + 'static {
    fn create(&self, cancellation: CancellationToken) -> BoxFuture<'static, anyhow::Result<R>>;
}

impl<R, F, Fut> ResourceFactory<R> for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn create(&self, cancellation: CancellationToken) -> BoxFuture<'static, anyhow::Result<R>> {
        self(cancellation).boxed()
    }
}

/// The observable state of a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Nothing references the handle and no resource is owned.
    Dead,
    /// Referenced, with the factory queued or running.
    Loading,
    /// Referenced, with the resource available.
    Alive,
    /// Referenced, with the factory having failed for this generation.
    Faulted,
}

/// The result of [`SharedResourceHandle::try_get_immediate`].
#[derive(Debug)]
pub enum ImmediateResource<R> {
    /// The resource of the current generation.
    Available(Arc<R>),
    /// The resource is not ready yet, or the handle is not referenced.
    Pending,
    /// The current generation failed, or the handle was torn down.
    Unavailable(ResourceError),
}

impl<R> ImmediateResource<R> {
    /// Returns the resource, if it is available.
    pub fn available(self) -> Option<Arc<R>> {
        match self {
            Self::Available(resource) => Some(resource),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    fn as_metric_tag(&self) -> &'static str {
        match self {
            Self::Available(_) => "available",
            Self::Pending => "pending",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Request metadata shared with the scheduler while a generation is queued.
#[derive(Debug, Default)]
struct RequestBasis {
    opportunistic: AtomicBool,
    first_requested: AtomicU64,
    latest_requested: AtomicU64,
}

impl RequestBasis {
    /// Starts over for a new generation.
    fn reset(&self, now: Tick) {
        self.opportunistic.store(true, Ordering::Relaxed);
        self.first_requested.store(now.0, Ordering::Relaxed);
        self.latest_requested.store(now.0, Ordering::Relaxed);
    }

    fn touch(&self, now: Tick) {
        self.latest_requested.store(now.0, Ordering::Relaxed);
    }

    fn promote(&self, now: Tick) {
        self.opportunistic.store(false, Ordering::Relaxed);
        self.touch(now);
    }
}

impl LoadBasis for RequestBasis {
    fn is_opportunistic(&self) -> bool {
        self.opportunistic.load(Ordering::Relaxed)
    }

    fn first_requested_tick(&self) -> Tick {
        Tick(self.first_requested.load(Ordering::Relaxed))
    }

    fn latest_requested_tick(&self) -> Tick {
        Tick(self.latest_requested.load(Ordering::Relaxed))
    }
}

/// State guarded by the revive lock.
struct Generation<R> {
    number: u64,
    /// No future or cancellation token is owned.
    released: bool,
    /// Revival is no longer allowed.
    torn_down: bool,
    future: Option<LoadFuture<R>>,
    cancellation: Option<CancellationToken>,
}

enum RefCountChange {
    /// The count was changed and is still positive.
    StillAlive(usize),
    /// The count went from one to zero.
    FinalRelease,
    /// The count is zero and was not changed.
    Dead,
}

pub(crate) struct HandleInner<R> {
    name: String,
    instance_id: u64,
    ref_count: AtomicUsize,
    self_reference_expiry: AtomicU64,
    content_queried: AtomicBool,
    basis: Arc<RequestBasis>,
    generation: Mutex<Generation<R>>,
    factory: Arc<dyn ResourceFactory<R>>,
    scheduler: LoadScheduler,
    reclaimer: FrameReclaimer,
    config: HandleConfig,
    pub(crate) legacy: Mutex<Weak<AvailableOnAccess<R>>>,
}

impl<R: Send + Sync + 'static> HandleInner<R> {
    fn alter_ref_count(&self, increment: bool) -> RefCountChange {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return RefCountChange::Dead;
            }
            let new = if increment { current + 1 } else { current - 1 };
            match self.ref_count.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if new == 0 => return RefCountChange::FinalRelease,
                Ok(_) => return RefCountChange::StillAlive(new),
                Err(actual) => current = actual,
            }
        }
    }

    fn add_ref(&self) -> Result<usize, ResourceError> {
        if let RefCountChange::StillAlive(count) = self.alter_ref_count(true) {
            tracing::trace!(handle = %self, count, "Added reference");
            return Ok(count);
        }

        let mut waits = 0u32;
        loop {
            {
                let mut generation = lock(&self.generation);

                // Somebody else may have revived the handle while we were waiting.
                if let RefCountChange::StillAlive(count) = self.alter_ref_count(true) {
                    return Ok(count);
                }
                if generation.torn_down {
                    return Err(ResourceError::Disposed);
                }
                if generation.released {
                    self.revive(&mut generation);
                    return Ok(1);
                }
            }

            // The final release of the previous generation is still detaching it.
            waits += 1;
            if waits <= self.config.revive_spin_limit {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }

    /// Takes a reference only if the handle is referenced already.
    ///
    /// Returns `false` for a dead handle, which is left dead.
    fn try_add_ref(&self) -> Result<bool, ResourceError> {
        if let RefCountChange::StillAlive(count) = self.alter_ref_count(true) {
            tracing::trace!(handle = %self, count, "Added reference");
            return Ok(true);
        }
        if lock(&self.generation).torn_down {
            return Err(ResourceError::Disposed);
        }
        Ok(false)
    }

    /// Starts a new generation. Must be called with the revive lock held and a count of zero.
    fn revive(&self, generation: &mut Generation<R>) {
        let cancellation = CancellationToken::new();
        self.basis.reset(self.scheduler.clock().now());

        let factory = Arc::clone(&self.factory);
        let basis: Arc<dyn LoadBasis> = self.basis.clone();
        let future = self.scheduler.submit(
            basis,
            move |token| factory.create(token),
            cancellation.clone(),
        );

        generation.number += 1;
        generation.future = Some(future);
        generation.cancellation = Some(cancellation);
        generation.released = false;
        self.ref_count.store(1, Ordering::Release);

        tracing::debug!(handle = %self, generation = generation.number, "Revived handle");
        metric!(counter("handle.revive") += 1);
    }

    /// Adds a reference while the caller is known to hold one already.
    fn add_ref_alive(&self) {
        match self.alter_ref_count(true) {
            RefCountChange::StillAlive(_) => {}
            _ => tracing::error!(handle = %self, "Expected handle to be referenced"),
        }
    }

    fn release(&self) -> Result<usize, ResourceError> {
        match self.alter_ref_count(false) {
            RefCountChange::StillAlive(count) => {
                tracing::trace!(handle = %self, count, "Released reference");
                Ok(count)
            }
            RefCountChange::FinalRelease => {
                self.final_release();
                Ok(0)
            }
            RefCountChange::Dead => {
                tracing::warn!(handle = %self, "Release called on an unreferenced handle");
                Err(ResourceError::Unreferenced)
            }
        }
    }

    fn final_release(&self) {
        let (number, future) = {
            let mut generation = lock(&self.generation);
            if let Some(cancellation) = generation.cancellation.take() {
                cancellation.cancel();
            }
            let future = generation.future.take();
            generation.released = true;
            (generation.number, future)
        };
        // The resource is dropped here, once nothing else holds on to it.
        drop(future);

        tracing::debug!(handle = %self, generation = number, "Released handle");
        metric!(counter("handle.final_release") += 1);
    }

    fn current_future(&self) -> Option<LoadFuture<R>> {
        lock(&self.generation).future.clone()
    }

    fn next_self_reference_expiry(&self) -> u64 {
        match self.config.self_reference_window {
            Some(window) => self.scheduler.clock().now().after(window).0.min(INFINITE),
            None => INFINITE,
        }
    }

    /// Pushes the self-reference expiry out by one window.
    ///
    /// Returns `true` if no self-reference was held before, in which case the caller has to supply
    /// the reference backing it.
    fn extend_self_reference(&self) -> bool {
        let new_expiry = self.next_self_reference_expiry();
        let mut current = self.self_reference_expiry.load(Ordering::Acquire);
        loop {
            match self.self_reference_expiry.compare_exchange_weak(
                current,
                new_expiry,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return previous == EXPIRED,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_self_reference(&self, immediate: bool) -> usize {
        loop {
            let expiry = self.self_reference_expiry.load(Ordering::Acquire);
            if expiry == EXPIRED {
                return self.ref_count.load(Ordering::Acquire);
            }
            if !immediate && expiry > self.scheduler.clock().now().0 {
                return self.ref_count.load(Ordering::Acquire);
            }
            if self
                .self_reference_expiry
                .compare_exchange(expiry, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            tracing::trace!(handle = %self, immediate, "Dropping self-reference");
            return self.release().unwrap_or(0);
        }
    }

    fn state(&self) -> HandleState {
        let future = {
            let generation = lock(&self.generation);
            if generation.released {
                return HandleState::Dead;
            }
            generation.future.clone()
        };
        match future.and_then(|future| future.now_or_never()) {
            None => HandleState::Loading,
            Some(Ok(_)) => HandleState::Alive,
            Some(Err(_)) => HandleState::Faulted,
        }
    }
}

impl<R> fmt::Display for HandleInner<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.instance_id)
    }
}

impl<R: Send + Sync + 'static> Releasable for HandleInner<R> {
    fn release_deferred(&self) {
        // Already reported by `release`.
        let _ = self.release();
    }
}

/// A shared, lazily created, reference counted resource.
///
/// Cloning the handle copies a pointer and does not take a reference.
pub struct SharedResourceHandle<R> {
    pub(crate) inner: Arc<HandleInner<R>>,
}

impl<R> Clone for SharedResourceHandle<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Display for SharedResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<R> fmt::Debug for SharedResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResourceHandle")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("ref_count", &self.inner.ref_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<R: Send + Sync + 'static> SharedResourceHandle<R> {
    /// Creates a new handle in the dead state.
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ResourceFactory<R>>,
        scheduler: LoadScheduler,
        reclaimer: FrameReclaimer,
        config: HandleConfig,
    ) -> Self {
        let basis = RequestBasis::default();
        basis.reset(scheduler.clock().now());
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                instance_id: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
                ref_count: AtomicUsize::new(0),
                self_reference_expiry: AtomicU64::new(EXPIRED),
                content_queried: AtomicBool::new(false),
                basis: Arc::new(basis),
                generation: Mutex::new(Generation {
                    number: 0,
                    released: true,
                    torn_down: false,
                    future: None,
                    cancellation: None,
                }),
                factory,
                scheduler,
                reclaimer,
                config,
                legacy: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Takes a reference and returns the new count.
    ///
    /// If the handle was dead, this starts a new generation by submitting the factory to the
    /// scheduler. Fails with [`ResourceError::Disposed`] only after the owning cache was torn down.
    pub fn add_ref(&self) -> Result<usize, ResourceError> {
        self.inner.add_ref()
    }

    /// Drops a reference and returns the new count.
    ///
    /// Dropping the last reference ends the generation: its factory is cancelled and the resource
    /// is dropped. Releasing a handle that holds no references fails with
    /// [`ResourceError::Unreferenced`] and changes nothing.
    pub fn release(&self) -> Result<usize, ResourceError> {
        self.inner.release()
    }

    /// Takes a reference that is released when the returned guard is dropped.
    pub fn acquire(&self) -> Result<RefGuard<R>, ResourceError> {
        self.add_ref()?;
        Ok(RefGuard::adopt(self.clone()))
    }

    /// Returns the resource if it is ready, without waiting.
    ///
    /// When the current generation has completed, the returned resource stays valid for the
    /// rest of the unit of work (the reference is handed to the [`FrameReclaimer`]) and the
    /// handle keeps itself alive for the configured self-reference window. A failed generation is
    /// kept the same way, so it is not attempted again on every unit of work.
    ///
    /// While the resource is not ready, the probe leaves the reference count as it found it. A dead
    /// handle is never revived by this and reports [`ImmediateResource::Pending`].
    pub fn try_get_immediate(&self) -> ImmediateResource<R> {
        let inner = &self.inner;
        inner.content_queried.store(true, Ordering::Relaxed);

        let result = match inner.try_add_ref() {
            Err(err) => ImmediateResource::Unavailable(err),
            Ok(false) => ImmediateResource::Pending,
            Ok(true) => {
                let guard = RefGuard::adopt(self.clone());
                inner.basis.touch(inner.scheduler.clock().now());
                let completed = inner
                    .current_future()
                    .and_then(|future| future.now_or_never());
                match completed {
                    // dropping the guard gives the speculative reference back
                    None => ImmediateResource::Pending,
                    Some(result) => {
                        if inner.extend_self_reference() {
                            inner.add_ref_alive();
                        }
                        if let Some(handle) = guard.disarm() {
                            inner.reclaimer.enqueue(handle.inner);
                        }

                        match result {
                            Ok(resource) => ImmediateResource::Available(resource),
                            Err(err) => ImmediateResource::Unavailable(err),
                        }
                    }
                }
            }
        };

        metric!(counter("handle.immediate") += 1, "result" => result.as_metric_tag());
        result
    }

    /// Warms up the resource without an explicit holder.
    ///
    /// This takes a reference whose request stays opportunistic and turns it into the
    /// self-reference, so the generation survives until the self-reference window lapses.
    pub fn prefetch(&self) -> Result<(), ResourceError> {
        let inner = &self.inner;
        inner.content_queried.store(true, Ordering::Relaxed);
        inner.add_ref()?;
        inner.basis.touch(inner.scheduler.clock().now());
        if !inner.extend_self_reference() {
            // A self-reference already exists and was just extended.
            inner.release()?;
        }
        Ok(())
    }

    /// Waits for the resource and returns a lease holding one reference on it.
    ///
    /// Marks the request as explicit, so it is scheduled ahead of every speculative request. The
    /// wait observes `cancellation` at least once every
    /// [`rent_poll_interval`](HandleConfig::rent_poll_interval). On cancellation, failure, or
    /// when the returned future is dropped, the reference is released again.
    pub async fn rent(
        &self,
        cancellation: CancellationToken,
    ) -> Result<ResourceLease<R>, ResourceError> {
        let result = self.rent_inner(cancellation).await;
        let tag = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        metric!(counter("handle.rent") += 1, "result" => tag);
        result
    }

    async fn rent_inner(
        &self,
        cancellation: CancellationToken,
    ) -> Result<ResourceLease<R>, ResourceError> {
        if cancellation.is_cancelled() {
            return Err(ResourceError::Cancelled);
        }

        let inner = &self.inner;
        inner.content_queried.store(true, Ordering::Relaxed);
        let guard = self.acquire()?;
        inner.basis.promote(inner.scheduler.clock().now());

        let future = inner.current_future().ok_or(ResourceError::Disposed)?;
        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    tracing::debug!(handle = %self, "Rent cancelled");
                    return Err(ResourceError::Cancelled);
                }
                result = tokio::time::timeout(inner.config.rent_poll_interval, future.clone()) => {
                    match result {
                        Ok(Ok(resource)) => return Ok(ResourceLease { resource, guard }),
                        Ok(Err(err)) => return Err(err),
                        Err(_) => tracing::trace!(handle = %self, "Still waiting for resource"),
                    }
                }
            }
        }
    }

    /// Drops the self-reference if it lapsed, or unconditionally if `immediate` is set.
    ///
    /// Returns the reference count afterwards.
    pub fn release_self_reference(&self, immediate: bool) -> usize {
        self.inner.release_self_reference(immediate)
    }

    /// A consumer view of this handle that cannot change the reference count directly.
    pub fn public(&self) -> SharedResource<R> {
        SharedResource {
            handle: self.clone(),
        }
    }

    pub fn state(&self) -> HandleState {
        self.inner.state()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    /// The number of generations started so far.
    pub fn generation(&self) -> u64 {
        lock(&self.inner.generation).number
    }

    /// Time until the self-reference lapses.
    ///
    /// This is zero if no self-reference is held, and [`Duration::MAX`] if it never lapses.
    pub fn self_reference_expires_in(&self) -> Duration {
        match self.inner.self_reference_expiry.load(Ordering::Acquire) {
            EXPIRED => Duration::ZERO,
            INFINITE => Duration::MAX,
            expiry => Tick(expiry).saturating_since(self.inner.scheduler.clock().now()),
        }
    }

    /// Whether the resource was ever asked for through `try_get_immediate`, `prefetch` or `rent`.
    pub fn content_queried(&self) -> bool {
        self.inner.content_queried.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    /// Forbids any further revival.
    ///
    /// Drops the self-reference afterwards and returns the future of the generation that is still
    /// referenced, if any.
    pub(crate) fn begin_teardown(&self) -> Option<LoadFuture<R>> {
        lock(&self.inner.generation).torn_down = true;
        self.release_self_reference(true);
        self.inner.current_future()
    }

    /// Cancels the factory of the current generation.
    pub(crate) fn force_cancel(&self) {
        if let Some(cancellation) = &lock(&self.inner.generation).cancellation {
            cancellation.cancel();
        }
    }
}

/// A consumer view of a [`SharedResourceHandle`].
///
/// This can look up resources, but cannot take or drop references by hand.
pub struct SharedResource<R> {
    handle: SharedResourceHandle<R>,
}

impl<R> Clone for SharedResource<R> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<R> fmt::Debug for SharedResource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedResource").field(&self.handle).finish()
    }
}

impl<R: Send + Sync + 'static> SharedResource<R> {
    /// See [`SharedResourceHandle::try_get_immediate`].
    pub fn try_get_immediate(&self) -> ImmediateResource<R> {
        self.handle.try_get_immediate()
    }

    /// Returns the resource if it is available, or `default` otherwise.
    pub fn get_or(&self, default: Arc<R>) -> Arc<R> {
        self.try_get_immediate().available().unwrap_or(default)
    }

    /// See [`SharedResourceHandle::rent`].
    pub async fn rent(
        &self,
        cancellation: CancellationToken,
    ) -> Result<ResourceLease<R>, ResourceError> {
        self.handle.rent(cancellation).await
    }

    /// See [`SharedResourceHandle::prefetch`].
    pub fn prefetch(&self) -> Result<(), ResourceError> {
        self.handle.prefetch()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }
}

/// One reference on a handle, released when dropped.
pub struct RefGuard<R: Send + Sync + 'static> {
    handle: Option<SharedResourceHandle<R>>,
}

impl<R: Send + Sync + 'static> RefGuard<R> {
    /// Takes ownership of a reference the caller already holds.
    fn adopt(handle: SharedResourceHandle<R>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Gives up ownership of the reference without releasing it.
    fn disarm(mut self) -> Option<SharedResourceHandle<R>> {
        self.handle.take()
    }

    pub fn handle(&self) -> Option<&SharedResourceHandle<R>> {
        self.handle.as_ref()
    }

    /// Releases the reference now and returns the new count.
    pub fn release(self) -> Result<usize, ResourceError> {
        match self.disarm() {
            Some(handle) => handle.release(),
            None => Err(ResourceError::Unreferenced),
        }
    }
}

impl<R: Send + Sync + 'static> fmt::Debug for RefGuard<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefGuard").field(&self.handle).finish()
    }
}

impl<R: Send + Sync + 'static> Drop for RefGuard<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Already reported by `release`.
            let _ = handle.inner.release();
        }
    }
}

/// A resource borrowed through [`SharedResourceHandle::rent`].
///
/// The lease holds one reference on its handle and releases it exactly once, either through
/// [`release`](Self::release) or when it is dropped.
pub struct ResourceLease<R: Send + Sync + 'static> {
    resource: Arc<R>,
    guard: RefGuard<R>,
}

impl<R: Send + Sync + 'static> ResourceLease<R> {
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    pub fn handle(&self) -> Option<&SharedResourceHandle<R>> {
        self.guard.handle()
    }

    /// Releases the lease and returns the handle's new reference count.
    pub fn release(self) -> Result<usize, ResourceError> {
        self.guard.release()
    }
}

impl<R: Send + Sync + 'static> std::ops::Deref for ResourceLease<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R: Send + Sync + 'static> Clone for ResourceLease<R> {
    fn clone(&self) -> Self {
        let guard = match self.guard.handle() {
            Some(handle) => {
                handle.inner.add_ref_alive();
                RefGuard::adopt(handle.clone())
            }
            None => RefGuard { handle: None },
        };
        Self {
            resource: Arc::clone(&self.resource),
            guard,
        }
    }
}

impl<R: Send + Sync + fmt::Debug + 'static> fmt::Debug for ResourceLease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("resource", &self.resource)
            .field("guard", &self.guard)
            .finish()
    }
}
