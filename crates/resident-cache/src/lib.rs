//! Shared, lazily created, reference counted resources.
//!
//! A [`ResourceCache`] maps stable keys to [`SharedResourceHandle`]s. A handle starts out as a
//! placeholder and only asks the [`LoadScheduler`] to run its [`ResourceFactory`] once somebody
//! actually references it. The scheduler bounds how many factories run at the same time and
//! always prefers explicit requests over speculative ones.
//!
//! ## Generations
//!
//! The span between a handle's reference count going from zero to one and back to zero is a
//! *generation*. Exactly one factory call is issued per generation. Once the last reference is
//! released, the generation's cancellation token is cancelled and the produced resource (if any)
//! is dropped. The next reference starts a brand new generation.
//!
//! ## Units of work
//!
//! [`SharedResourceHandle::try_get_immediate`] hands out resources without requiring the caller
//! to release anything. The reference it takes is queued on the [`FrameReclaimer`], which the host
//! flushes once per unit of work (e.g. once per rendered frame). The host should also call
//! [`ResourceCache::maintain`] at that point so handles that fell out of use are evicted.

#![warn(missing_debug_implementations)]

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod handle;
pub mod legacy;
pub mod logging;
pub mod reclaimer;
pub mod scheduler;
pub mod utils;

pub use cache::ResourceCache;
pub use clock::{Clock, Tick};
pub use config::{Config, HandleConfig, SchedulerConfig};
pub use error::ResourceError;
pub use handle::{
    HandleState, ImmediateResource, RefGuard, ResourceFactory, ResourceLease, SharedResource,
    SharedResourceHandle,
};
pub use reclaimer::{FrameReclaimer, Releasable};
pub use scheduler::{
    FixedBasis, LoadBasis, LoadFuture, LoadResult, LoadScheduler, SchedulerStats,
};

pub use tokio_util::sync::CancellationToken;
