use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use futures::future::BoxFuture;
use rand::Rng;
use resident_cache::{
    CancellationToken, Config, FrameReclaimer, ImmediateResource, LoadScheduler, ResourceCache,
    ResourceError, ResourceFactory,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    /// How often the frame loop flushes the reclaimer and maintains the caches.
    #[serde(default = "default_frame_interval", with = "humantime_serde")]
    pub frame_interval: Duration,
    pub workloads: Vec<Workload>,
}

fn default_frame_interval() -> Duration {
    Duration::from_millis(16)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys the workload picks from at random.
    pub keys: u64,
    pub mode: Mode,
    #[serde(flatten)]
    pub resource: SyntheticConfig,
    /// How long a rented resource is held on to.
    #[serde(default, with = "humantime_serde")]
    pub hold: Duration,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Rent,
    Immediate,
    Prefetch,
}

/// How the resources of a workload are produced.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct SyntheticConfig {
    #[serde(default, with = "humantime_serde")]
    pub load_time: Duration,
    #[serde(default)]
    pub failure_rate: f64,
    #[serde(default)]
    pub size: usize,
}

#[derive(Debug)]
pub struct SyntheticResource {
    pub key: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct SyntheticFactory {
    key: u64,
    config: SyntheticConfig,
}

impl ResourceFactory<SyntheticResource> for SyntheticFactory {
    fn create(
        &self,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<SyntheticResource>> {
        let SyntheticConfig {
            load_time,
            failure_rate,
            size,
        } = self.config;
        let key = self.key;
        let fails = rand::rng().random_bool(failure_rate);

        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(load_time) => {}
                _ = cancellation.cancelled() => anyhow::bail!("loading {key} was cancelled"),
            }
            ensure!(!fails, "synthetic failure loading {key}");
            Ok(SyntheticResource {
                key,
                bytes: vec![0; size],
            })
        })
    }
}

pub type SyntheticCache = ResourceCache<u64, SyntheticResource>;

/// A workload with its cache, ready to run.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub keys: u64,
    pub mode: Mode,
    pub hold: Duration,
    pub cache: SyntheticCache,
}

pub fn prepare_workload(
    workload: Workload,
    config: &Config,
    scheduler: &LoadScheduler,
    reclaimer: &FrameReclaimer,
) -> Result<PreparedWorkload> {
    let Workload {
        concurrency,
        keys,
        mode,
        resource,
        hold,
    } = workload;
    ensure!(concurrency > 0, "workload concurrency must be positive");
    ensure!(keys > 0, "workload needs at least one key");
    ensure!(
        (0.0..=1.0).contains(&resource.failure_rate),
        "failure rate must be between 0 and 1"
    );

    let cache = ResourceCache::new(
        config,
        scheduler.clone(),
        reclaimer.clone(),
        move |key: &u64| {
            let factory = SyntheticFactory {
                key: *key,
                config: resource,
            };
            Arc::new(factory) as Arc<dyn ResourceFactory<SyntheticResource>>
        },
    );

    Ok(PreparedWorkload {
        concurrency,
        keys,
        mode,
        hold,
        cache,
    })
}

/// The outcome of a single operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Hit,
    Miss,
    Failed,
}

pub async fn process_operation(workload: &PreparedWorkload) -> Outcome {
    let key = rand::rng().random_range(0..workload.keys);
    let resource = match workload.cache.get(&key) {
        Ok(resource) => resource,
        Err(_) => return Outcome::Failed,
    };

    match workload.mode {
        Mode::Rent => match resource.rent(CancellationToken::new()).await {
            Ok(lease) => {
                debug_assert_eq!(lease.key, key);
                std::hint::black_box(lease.bytes.len());
                if !workload.hold.is_zero() {
                    tokio::time::sleep(workload.hold).await;
                }
                Outcome::Hit
            }
            Err(ResourceError::Cancelled | ResourceError::Disposed) => Outcome::Miss,
            Err(_) => Outcome::Failed,
        },
        Mode::Immediate => match resource.try_get_immediate() {
            ImmediateResource::Available(_) => Outcome::Hit,
            // like a host drawing a placeholder, ask for the resource to be loaded in the meantime
            ImmediateResource::Pending => match resource.prefetch() {
                Ok(()) => Outcome::Miss,
                Err(_) => Outcome::Failed,
            },
            ImmediateResource::Unavailable(_) => Outcome::Failed,
        },
        Mode::Prefetch => match resource.prefetch() {
            Ok(()) => Outcome::Hit,
            Err(_) => Outcome::Failed,
        },
    }
}
