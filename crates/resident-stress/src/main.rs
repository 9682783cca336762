use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use resident_cache::Config;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable `sentry` by sending events to this DSN.
    #[arg(long)]
    sentry_dsn: Option<String>,

    /// Enable JSON logging into the void, like in production.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, sent to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run(Cli::parse()) {
        resident_cache::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let cache_config = Config::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        backtraces: true,
        sentry_dsn: cli.sentry_dsn,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: No other threads exist yet, the runtime is started below.
    let mut logging_guard = unsafe { logging::init(logging_config, &cache_config)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("resident-stress")
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(cache_config, workloads, cli.duration).await
    })
}
