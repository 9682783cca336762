use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::{Config, HandleConfig};
use crate::error::ResourceError;
use crate::handle::{ResourceFactory, SharedResource, SharedResourceHandle};
use crate::reclaimer::FrameReclaimer;
use crate::scheduler::LoadScheduler;
use crate::utils::lock;

type FactoryFor<K, R> = dyn Fn(&K) -> Arc<dyn ResourceFactory<R>> + Send + Sync;

struct CacheState<K, R> {
    entries: FxHashMap<K, SharedResourceHandle<R>>,
    /// Handles removed by `invalidate` that were still referenced.
    invalidated: Vec<SharedResourceHandle<R>>,
    torn_down: bool,
}

/// Maps keys to [`SharedResourceHandle`]s.
///
/// Handles are created as placeholders on first lookup, and only load their resource once they
/// are referenced. The host is expected to call [`maintain`](Self::maintain) once per unit of
/// work, right after flushing the [`FrameReclaimer`].
pub struct ResourceCache<K, R> {
    state: Mutex<CacheState<K, R>>,
    scheduler: LoadScheduler,
    reclaimer: FrameReclaimer,
    handle_config: HandleConfig,
    teardown_timeout: Duration,
    factory_for: Box<FactoryFor<K, R>>,
}

impl<K, R> fmt::Debug for ResourceCache<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("ResourceCache")
            .field("entries", &state.entries.len())
            .field("invalidated", &state.invalidated.len())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}

impl<K, R> ResourceCache<K, R>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    R: Send + Sync + 'static,
{
    /// Creates a new cache.
    ///
    /// `factory_for` is called once per handle, with the key the handle is created for.
    pub fn new<F>(
        config: &Config,
        scheduler: LoadScheduler,
        reclaimer: FrameReclaimer,
        factory_for: F,
    ) -> Self
    where
        F: Fn(&K) -> Arc<dyn ResourceFactory<R>> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(CacheState {
                entries: FxHashMap::default(),
                invalidated: Vec::new(),
                torn_down: false,
            }),
            scheduler,
            reclaimer,
            handle_config: config.handles,
            teardown_timeout: config.teardown_timeout,
            factory_for: Box::new(factory_for),
        }
    }

    /// Returns the handle for `key`, creating a dead one if there is none yet.
    pub fn handle(&self, key: &K) -> Result<SharedResourceHandle<R>, ResourceError> {
        let mut state = lock(&self.state);
        if state.torn_down {
            return Err(ResourceError::Disposed);
        }
        if let Some(handle) = state.entries.get(key) {
            return Ok(handle.clone());
        }

        let handle = SharedResourceHandle::new(
            format!("{key:?}"),
            (self.factory_for)(key),
            self.scheduler.clone(),
            self.reclaimer.clone(),
            self.handle_config,
        );
        tracing::trace!(handle = %handle, "Created handle");
        state.entries.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Returns a consumer view of the handle for `key`.
    pub fn get(&self, key: &K) -> Result<SharedResource<R>, ResourceError> {
        self.handle(key).map(|handle| handle.public())
    }

    /// Evicts handles that fell out of use and returns how many were evicted.
    ///
    /// A handle is evicted once it was queried, its self-reference lapsed, nothing references it
    /// and there is no legacy accessor keeping it around. Invalidated handles are forgotten once
    /// nothing references them any more.
    pub fn maintain(&self) -> usize {
        let mut state = lock(&self.state);
        let before = state.entries.len() + state.invalidated.len();

        state.entries.retain(|_, handle| {
            let unused = handle.content_queried()
                && handle.release_self_reference(false) == 0
                && !handle.has_revival_possibility();
            !unused
        });
        state.invalidated.retain(|handle| {
            handle.release_self_reference(false) != 0 || handle.has_revival_possibility()
        });

        let evicted = before - state.entries.len() - state.invalidated.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = state.entries.len(), "Evicted unused handles");
        }
        evicted
    }

    /// Removes `keys` so that their next lookup creates a fresh handle.
    ///
    /// Removed handles that are still referenced keep their resource until they are released.
    pub fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a K>) {
        let mut state = lock(&self.state);
        for key in keys {
            let Some(handle) = state.entries.remove(key) else {
                continue;
            };
            tracing::debug!(handle = %handle, "Invalidated handle");
            if handle.release_self_reference(true) != 0 || handle.has_revival_possibility() {
                state.invalidated.push(handle);
            }
        }
    }

    /// Tears the cache down for good.
    ///
    /// Every self-reference is dropped and no handle can be revived any more. Outstanding loads get
    /// up to the configured teardown timeout to finish, after which they are cancelled.
    pub async fn teardown(&self) {
        let handles = {
            let mut state = lock(&self.state);
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            let mut handles: Vec<_> = state.entries.drain().map(|(_, handle)| handle).collect();
            handles.append(&mut state.invalidated);
            handles
        };
        tracing::info!(handles = handles.len(), "Tearing down resource cache");

        let outstanding: Vec<_> = handles
            .iter()
            .filter_map(|handle| handle.begin_teardown())
            .collect();

        let drained = tokio::time::timeout(
            self.teardown_timeout,
            futures::future::join_all(outstanding),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(
                timeout = ?self.teardown_timeout,
                "Resource cache did not drain in time, cancelling outstanding loads"
            );
            for handle in &handles {
                handle.force_cancel();
            }
        }
    }

    /// The number of live entries, not counting invalidated handles.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).torn_down
    }

    /// Every handle the cache knows about, including invalidated ones.
    pub fn handles_for_debug(&self) -> Vec<SharedResourceHandle<R>> {
        let state = lock(&self.state);
        state
            .entries
            .values()
            .chain(state.invalidated.iter())
            .cloned()
            .collect()
    }

    pub fn scheduler(&self) -> &LoadScheduler {
        &self.scheduler
    }

    pub fn reclaimer(&self) -> &FrameReclaimer {
        &self.reclaimer
    }
}
