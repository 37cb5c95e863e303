use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info};

const MB: f64 = 1024.0 * 1024.0;

/// A unit of work the scheduler can run. Heavy work inside `run` belongs on
/// the blocking pool so that jobs of one batch truly overlap.
#[async_trait]
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    /// Bytes this job accounts for in progress output.
    fn size(&self) -> u64;

    /// Path or name shown in the progress line.
    fn label(&self) -> String;

    /// Hash shown in the progress line.
    fn hash(&self) -> String;

    async fn run(self) -> Result<Self::Output>;
}

/// Where a batch sits inside a larger run, so that consecutive batches report
/// progress against one shared total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTotals {
    pub count_total: u64,
    pub count_offset: u64,
    pub size_total: u64,
    pub size_offset: u64,
}

impl BatchTotals {
    pub fn for_jobs<J: Job>(jobs: &[J]) -> Self {
        Self {
            count_total: jobs.len() as u64,
            count_offset: 0,
            size_total: jobs.iter().map(Job::size).sum(),
            size_offset: 0,
        }
    }
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub outputs: Vec<T>,
    pub completed: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl<T> BatchReport<T> {
    fn empty() -> Self {
        Self {
            outputs: Vec::new(),
            completed: 0,
            failed: 0,
            bytes: 0,
        }
    }
}

/// Runs batches of homogeneous jobs with a bounded number in flight.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pace_interval: Duration,
}

impl Scheduler {
    pub fn new(pace_interval: Duration) -> Self {
        Self { pace_interval }
    }

    pub async fn run<J: Job>(&self, jobs: Vec<J>, parallelism: usize) -> Result<BatchReport<J::Output>> {
        let totals = BatchTotals::for_jobs(&jobs);
        self.run_with_totals(jobs, parallelism, totals).await
    }

    /// Runs every job. Failed jobs are logged and counted; a fatal error stops
    /// the batch and is returned.
    pub async fn run_with_totals<J: Job>(
        &self,
        jobs: Vec<J>,
        parallelism: usize,
        totals: BatchTotals,
    ) -> Result<BatchReport<J::Output>> {
        if jobs.is_empty() {
            return Ok(BatchReport::empty());
        }

        let parallelism = parallelism.max(1);
        info!("starting - {} in parallel", parallelism);

        let progress = Progress::new(totals, self.pace_interval);
        let progress = &progress;

        let mut results = stream::iter(jobs)
            .map(|job| async move {
                let size = job.size();
                let label = job.label();
                let hash = job.hash();
                let result = job.run().await;
                progress.record(size, &label, &hash);
                (size, label, result)
            })
            .buffer_unordered(parallelism);

        let mut report = BatchReport::empty();
        while let Some((size, label, result)) = results.next().await {
            match result {
                Ok(output) => {
                    report.completed += 1;
                    report.bytes += size;
                    report.outputs.push(output);
                }
                Err(e) if e.is_fatal() => {
                    error!(job = %label, error = %e, "fatal error, aborting batch");
                    return Err(e);
                }
                Err(e) => {
                    report.failed += 1;
                    log_failure(&label, &e);
                }
            }
        }

        Ok(report)
    }
}

fn log_failure(label: &str, e: &Error) {
    match e {
        Error::Format(_) => error!(job = %label, error = %e, "job aborted on unreadable data"),
        Error::Integrity { .. } => error!(job = %label, error = %e, "integrity check failed"),
        _ => error!(job = %label, error = %e, "job failed"),
    }
}

struct Progress {
    totals: BatchTotals,
    count_done: AtomicU64,
    size_done: AtomicU64,
    started: Instant,
    pace_interval_ms: u64,
    last_pace_ms: AtomicU64,
}

impl Progress {
    fn new(totals: BatchTotals, pace_interval: Duration) -> Self {
        Self {
            totals,
            count_done: AtomicU64::new(0),
            size_done: AtomicU64::new(0),
            started: Instant::now(),
            pace_interval_ms: pace_interval.as_millis() as u64,
            last_pace_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, size: u64, label: &str, hash: &str) {
        let count_done = self.count_done.fetch_add(1, Ordering::Relaxed) + 1;
        let size_done = self.size_done.fetch_add(size, Ordering::Relaxed) + size;

        let count_all = count_done + self.totals.count_offset;
        let size_all = size_done + self.totals.size_offset;

        info!(
            "{} / {} ({:.2}%) size: {:.2} / {:.2} MB ({:.2}%) \"{}\" {}",
            count_all,
            self.totals.count_total,
            percent(count_all, self.totals.count_total),
            size_all as f64 / MB,
            self.totals.size_total as f64 / MB,
            percent(size_all, self.totals.size_total),
            label,
            hash
        );

        if self.pace_due() {
            self.log_pace(count_done, size_done);
        }
    }

    /// True for at most one caller per pace interval.
    fn pace_due(&self) -> bool {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_pace_ms.load(Ordering::Relaxed);
        now.saturating_sub(last) >= self.pace_interval_ms
            && self
                .last_pace_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
    }

    fn log_pace(&self, count_done: u64, size_done: u64) {
        let secs = self.started.elapsed().as_secs_f64().max(0.001);

        let remaining_files = self
            .totals
            .count_total
            .saturating_sub(count_done + self.totals.count_offset);
        let remaining_mb = self
            .totals
            .size_total
            .saturating_sub(size_done + self.totals.size_offset) as f64
            / MB;

        let files_per_sec = count_done as f64 / secs;
        let mb_per_sec = size_done as f64 / MB / secs;

        info!("  | todo  | {} files        | {:.2} MB", remaining_files, remaining_mb);
        info!("  | speed | {:.2} files/sec   | {:.2} MB/sec", files_per_sec, mb_per_sec);
        info!(
            "  | time  | {} by files | {} by size",
            eta(remaining_files as f64, files_per_sec),
            eta(remaining_mb, mb_per_sec)
        );
    }
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

fn eta(remaining: f64, rate: f64) -> String {
    if rate <= 0.0 {
        return "--h:--min".to_string();
    }
    let minutes = (remaining / rate / 60.0) as u64;
    format!("{:02}h:{:02}min", minutes / 60, minutes % 60)
}
