//! Interval scheduler backing `PeriodicOperationsModule`s.

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type JobFuture = BoxFuture<'static, Result<()>>;

type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct ScheduledJob {
    name: String,
    period: Duration,
    job: JobFn,
}

/// Collects recurring jobs during startup and runs each on its own task.
///
/// Jobs never overlap with themselves: a tick that fires while the previous
/// run is still executing is skipped.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `job` to run every `period`, first run one period after start.
    pub fn every<F>(&mut self, name: impl Into<String>, period: Duration, job: F) -> Result<()>
    where
        F: Fn() -> JobFuture + Send + Sync + 'static,
    {
        let name = name.into();
        if period.is_zero() {
            bail!("periodic job {name} must have a non-zero period");
        }

        self.jobs.push(ScheduledJob {
            name,
            period,
            job: Arc::new(job),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|job| job.name.as_str())
    }

    /// Spawns one task per job. Tasks run until `shutdown` is cancelled; job
    /// errors are logged and the job keeps its schedule.
    pub fn start(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| spawn_job(job, shutdown.clone()))
            .collect()
    }
}

fn spawn_job(job: ScheduledJob, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ScheduledJob { name, period, job } = job;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(job = %name, period_ms = period.as_millis() as u64, "periodic job scheduled");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(job = %name, "periodic job stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = job().await {
                        tracing::error!(job = %name, error = %err, "periodic job failed");
                    }
                }
            }
        }
    })
}
