use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "resident".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls the [`LoadScheduler`](crate::LoadScheduler).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// The number of factories that may run at the same time.
    ///
    /// When unset, this is derived from the available parallelism, capped at
    /// `concurrency_ceiling`.
    pub max_concurrency: Option<usize>,
    /// Upper bound for the derived concurrency.
    pub concurrency_ceiling: usize,
    /// How long [`shutdown`](crate::LoadScheduler::shutdown) waits for active factories before
    /// cancelling them.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl SchedulerConfig {
    /// The concurrency limit the scheduler actually uses.
    pub fn effective_concurrency(&self) -> usize {
        let limit = match self.max_concurrency {
            Some(max) => max,
            None => {
                let parallelism = std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1);
                parallelism.min(self.concurrency_ceiling)
            }
        };
        limit.max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            concurrency_ceiling: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Fine-tuning of [`SharedResourceHandle`](crate::SharedResourceHandle) lifetimes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HandleConfig {
    /// How long a resource is kept alive after it was last handed out by
    /// [`try_get_immediate`](crate::SharedResourceHandle::try_get_immediate).
    ///
    /// `None` means the self-reference never lapses on its own and is only dropped by an
    /// immediate release, e.g. on teardown.
    #[serde(with = "humantime_serde")]
    pub self_reference_window: Option<Duration>,

    /// Maximum time a [`rent`](crate::SharedResourceHandle::rent) call waits on the resource
    /// before looking at its cancellation token again.
    #[serde(with = "humantime_serde")]
    pub rent_poll_interval: Duration,

    /// Number of times a reviving `add_ref` yields while waiting for a concurrent final release,
    /// before it backs off with short sleeps.
    pub revive_spin_limit: u32,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            self_reference_window: Some(Duration::from_secs(2)),
            rent_poll_interval: Duration::from_secs(1),
            revive_spin_limit: 64,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// Configuration of the shared load scheduler.
    pub scheduler: SchedulerConfig,

    /// Configuration of every handle created by a cache.
    pub handles: HandleConfig,

    /// How long a cache teardown waits for outstanding loads before cancelling them.
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: Logging::default(),
            metrics: Metrics::default(),
            scheduler: SchedulerConfig::default(),
            handles: HandleConfig::default(),
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
