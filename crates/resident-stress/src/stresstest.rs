use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use resident_cache::{Config, FrameReclaimer, LoadScheduler};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::workloads::{
    Outcome, PreparedWorkload, WorkloadsConfig, prepare_workload, process_operation,
};

#[derive(Default)]
struct Report {
    durations: DDSketch,
    misses: usize,
    failures: usize,
}

#[derive(Debug, Default)]
struct FrameReport {
    frames: usize,
    released: usize,
    evicted: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let scheduler = LoadScheduler::new(&config.scheduler, runtime);
    let reclaimer = FrameReclaimer::new();

    // initialize workloads
    let frame_interval = workloads.frame_interval;
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| prepare_workload(workload, &config, &scheduler, &reclaimer).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // the host's unit of work: flush deferred releases, then evict what fell out of use
    let frames_done = CancellationToken::new();
    let frame_loop = {
        let workloads = workloads.clone();
        let reclaimer = reclaimer.clone();
        let frames_done = frames_done.clone();
        tokio::spawn(async move {
            let mut report = FrameReport::default();
            let mut interval = tokio::time::interval(frame_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = frames_done.cancelled() => break,
                }
                report.frames += 1;
                report.released += reclaimer.flush();
                for workload in &workloads {
                    report.evicted += workload.cache.maintain();
                }
            }
            report
        })
    };

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter().cloned() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let report = Arc::new(Mutex::new(Report::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let report = Arc::clone(&report);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let outcome = process_operation(&workload).await;

                            transaction.finish();

                            record(&report, outcome, task_start.elapsed());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let report = std::mem::take(&mut *report.lock().unwrap_or_else(|e| e.into_inner()));
            (concurrency, report)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    frames_done.cancel();
    let frames = frame_loop.await?;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, report) = task?;
        print_report(i, concurrency, &report, duration);
    }
    println!(
        "Frames: {}; deferred releases: {}; evicted handles: {}",
        frames.frames, frames.released, frames.evicted
    );

    shutdown(&config, &workloads, &scheduler, &reclaimer).await;
    Ok(())
}

fn record(report: &Mutex<Report>, outcome: Outcome, elapsed: Duration) {
    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
    report.durations.add(elapsed.as_secs_f64());
    match outcome {
        Outcome::Hit => {}
        Outcome::Miss => report.misses += 1,
        Outcome::Failed => report.failures += 1,
    }
}

fn print_report(i: usize, concurrency: usize, report: &Report, duration: Duration) {
    let durations = &report.durations;
    let ops = durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!(
        "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {} misses, {} failures",
        report.misses, report.failures
    );
    if ops == 0 {
        return;
    }

    let quantile = |q| {
        let value = durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(value)
    };
    let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
    let p50 = quantile(0.5);
    let p90 = quantile(0.9);
    let p99 = quantile(0.99);
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}

async fn shutdown(
    config: &Config,
    workloads: &[Arc<PreparedWorkload>],
    scheduler: &LoadScheduler,
    reclaimer: &FrameReclaimer,
) {
    let start = Instant::now();
    reclaimer.flush();
    futures::future::join_all(workloads.iter().map(|workload| workload.cache.teardown())).await;
    reclaimer.flush();
    scheduler.shutdown(config.scheduler.shutdown_grace).await;
    println!("Shutdown: {:?}", start.elapsed());
}
