//! Job scheduler driven by an injectable clock
//!
//! A registry of (cadence, job) pairs. `run_due` spawns every job whose due
//! instant has passed on the scheduler's clock; `run_forever` polls it on a
//! `tokio::time::interval`. A job whose previous run is still executing is
//! skipped for that tick, so one job never overlaps itself, while different
//! jobs run concurrently.
//!
//! Aggregation and delta jobs keep a `BucketBacklog`: a bucket stays owed
//! until its run succeeds, so a failed or coalesced tick is made up by the
//! next one.
//!
//! Tests drive a `ManualClock` and call `run_due_and_wait` instead of waiting
//! on wall-clock time.

use super::aggregator::{BucketRunSummary, IntervalAggregator};
use super::archival::ArchivalMover;
use super::clock::Clock;
use super::delta::DeltaCalculator;
use super::interval::IntervalType;
use super::series::SeriesCatalog;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Grace period after a bucket closes before its first job fires
pub const CLOSE_GRACE_SECS: i64 = 30;
/// Extra delay per rollup hop, so a rollup runs after its source interval
pub const ROLLUP_STAGGER_SECS: i64 = 300;
/// Most buckets one tick works through; the rest wait for the next tick
pub const MAX_BUCKETS_PER_RUN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cadence {
    /// Once per bucket, `delay` after the bucket closes
    AfterClose { interval: IntervalType, delay: Duration },
    /// Fixed period
    Every(Duration),
}

impl Cadence {
    /// Standard cadence for jobs of `interval`, staggered by rollup depth
    pub fn for_interval(interval: IntervalType) -> Self {
        Cadence::AfterClose {
            interval,
            delay: Duration::seconds(
                CLOSE_GRACE_SECS + ROLLUP_STAGGER_SECS * interval.rollup_depth() as i64,
            ),
        }
    }

    /// First due instant strictly after `after`
    pub fn next_due(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::AfterClose { interval, delay } => interval.next_boundary(after - delay) + delay,
            Cadence::Every(period) => after + period,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> String;

    async fn run(&self, now: DateTime<Utc>) -> Result<(), StoreError>;
}

struct Entry {
    cadence: Cadence,
    job: Arc<dyn Job>,
    next_due: DateTime<Utc>,
    running: Arc<AtomicBool>,
}

/// Clears the running flag even if the job panics
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Vec::new(),
        }
    }

    /// Register a job; it first fires at the cadence's next due instant
    pub fn register(&mut self, cadence: Cadence, job: Arc<dyn Job>) -> &mut Self {
        let next_due = cadence.next_due(self.clock.now());
        log::debug!("⏰ Registered {} (first run {})", job.name(), next_due.to_rfc3339());
        self.entries.push(Entry {
            cadence,
            job,
            next_due,
            running: Arc::new(AtomicBool::new(false)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Job names with their next due instant
    pub fn upcoming(&self) -> Vec<(String, DateTime<Utc>)> {
        self.entries
            .iter()
            .map(|e| (e.job.name(), e.next_due))
            .collect()
    }

    /// Spawn every due job that is not still running
    ///
    /// Missed ticks are coalesced: a due job runs once and its next due
    /// instant is computed from the current time.
    pub fn run_due(&mut self) -> Vec<JoinHandle<()>> {
        let now = self.clock.now();
        let mut handles = Vec::new();

        for entry in &mut self.entries {
            if now < entry.next_due {
                continue;
            }
            entry.next_due = entry.cadence.next_due(now);

            if entry.running.swap(true, Ordering::SeqCst) {
                log::warn!("⚠️  {} still running, tick skipped", entry.job.name());
                continue;
            }

            let job = Arc::clone(&entry.job);
            let guard = RunningGuard(Arc::clone(&entry.running));
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                let started = std::time::Instant::now();
                match job.run(now).await {
                    Ok(()) => log::debug!(
                        "✅ {} finished in {}ms",
                        job.name(),
                        started.elapsed().as_millis()
                    ),
                    Err(e) => log::error!("❌ {} failed: {}", job.name(), e),
                }
            }));
        }
        handles
    }

    /// Run due jobs and wait for them; returns how many were started
    pub async fn run_due_and_wait(&mut self) -> usize {
        let handles = self.run_due();
        let started = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("❌ Scheduled job panicked: {}", e);
            }
        }
        started
    }

    /// Poll forever; never returns
    pub async fn run_forever(mut self, poll: std::time::Duration) {
        log::info!("⏰ Starting scheduler ({} jobs, poll: {}ms)", self.entries.len(), poll.as_millis());
        for (name, due) in self.upcoming() {
            log::info!("   ├─ {} → {}", name, due.to_rfc3339());
        }

        let mut timer = tokio::time::interval(poll);
        loop {
            timer.tick().await;
            self.run_due();
        }
    }
}

/// Closed buckets of one interval still owed a successful run
///
/// The watermark is the first unprocessed bucket. It starts at the last bucket
/// closed before the first run and only moves past a bucket once that bucket's
/// run succeeded.
pub struct BucketBacklog {
    interval: IntervalType,
    next: Mutex<Option<DateTime<Utc>>>,
}

impl BucketBacklog {
    pub fn new(interval: IntervalType) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    /// Owed buckets closed at or before `now`, oldest first
    pub fn pending(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let last = self.interval.last_closed_bucket(now);
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut bucket = match *next {
            Some(bucket) => bucket,
            None => {
                *next = Some(last);
                last
            }
        };

        let mut buckets = Vec::new();
        while bucket <= last && buckets.len() < MAX_BUCKETS_PER_RUN {
            buckets.push(bucket);
            bucket = self.interval.bucket_end(bucket);
        }
        buckets
    }

    /// Move the watermark past `bucket`
    pub fn complete(&self, bucket: DateTime<Utc>) {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let after = self.interval.bucket_end(bucket);
        if next.map_or(true, |current| current < after) {
            *next = Some(after);
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        *self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Run every owed bucket in order, stopping at the first one that fails
async fn drain_backlog<F, Fut>(
    name: &str,
    backlog: &BucketBacklog,
    now: DateTime<Utc>,
    run: F,
) -> Result<(), StoreError>
where
    F: Fn(DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<BucketRunSummary, StoreError>>,
{
    let pending = backlog.pending(now);
    if pending.len() > 1 {
        log::info!(
            "⏰ {} catching up {} buckets from {}",
            name,
            pending.len(),
            pending[0].to_rfc3339()
        );
    }

    for bucket in pending {
        let summary = run(bucket).await?;
        if summary.failed > 0 {
            return Err(StoreError::Transient(format!(
                "{} of {} pairs failed for {} @ {}",
                summary.failed,
                summary.pairs,
                name,
                bucket.to_rfc3339()
            )));
        }
        backlog.complete(bucket);
    }
    Ok(())
}

pub struct AggregationJob {
    aggregator: Arc<IntervalAggregator>,
    interval: IntervalType,
    backlog: BucketBacklog,
}

impl AggregationJob {
    pub fn new(aggregator: Arc<IntervalAggregator>, interval: IntervalType) -> Self {
        Self {
            aggregator,
            interval,
            backlog: BucketBacklog::new(interval),
        }
    }
}

#[async_trait]
impl Job for AggregationJob {
    fn name(&self) -> String {
        format!("aggregate:{}", self.interval)
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        drain_backlog(&self.name(), &self.backlog, now, |bucket| {
            self.aggregator.run_for_bucket(self.interval, bucket, now)
        })
        .await
    }
}

pub struct DeltaJob {
    calculator: Arc<DeltaCalculator>,
    interval: IntervalType,
    backlog: BucketBacklog,
}

impl DeltaJob {
    pub fn new(calculator: Arc<DeltaCalculator>, interval: IntervalType) -> Self {
        Self {
            calculator,
            interval,
            backlog: BucketBacklog::new(interval),
        }
    }
}

#[async_trait]
impl Job for DeltaJob {
    fn name(&self) -> String {
        format!("delta:{}", self.interval)
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        drain_backlog(&self.name(), &self.backlog, now, |bucket| {
            self.calculator.run_for_bucket(self.interval, bucket, now)
        })
        .await
    }
}

/// Archives every series of the catalog; one failing series does not stop the rest
pub struct ArchivalJob {
    mover: Arc<ArchivalMover>,
    catalog: Arc<SeriesCatalog>,
}

impl ArchivalJob {
    pub fn new(mover: Arc<ArchivalMover>, catalog: Arc<SeriesCatalog>) -> Self {
        Self { mover, catalog }
    }
}

#[async_trait]
impl Job for ArchivalJob {
    fn name(&self) -> String {
        "archive".to_string()
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut first_error = None;
        let mut note = |class: &str, result: Result<(), StoreError>| {
            if let Err(e) = result {
                log::error!("❌ Archival of {} aborted: {}", class, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        let readings = &self.catalog.readings;
        note(readings.data_class(), self.mover.run(readings, now).await.map(|_| ()));
        for series in self.catalog.all_averages() {
            note(series.data_class(), self.mover.run(series, now).await.map(|_| ()));
        }
        for series in self.catalog.all_deltas() {
            note(series.data_class(), self.mover.run(series, now).await.map(|_| ()));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Register aggregation and delta jobs for every interval plus the archival job
pub fn register_standard_jobs(
    scheduler: &mut Scheduler,
    aggregator: Arc<IntervalAggregator>,
    calculator: Arc<DeltaCalculator>,
    mover: Arc<ArchivalMover>,
    catalog: Arc<SeriesCatalog>,
    archive_every: Duration,
) {
    for interval in IntervalType::all() {
        let cadence = Cadence::for_interval(interval);
        scheduler.register(cadence, Arc::new(AggregationJob::new(Arc::clone(&aggregator), interval)));
        scheduler.register(cadence, Arc::new(DeltaJob::new(Arc::clone(&calculator), interval)));
    }
    scheduler.register(Cadence::Every(archive_every), Arc::new(ArchivalJob::new(mover, catalog)));
}
