use std::{sync::Arc, time::Duration};

use super::{metrics, registry::Location, unix_now};
use crate::{
    error::{Error, Result},
    scheduler::{BackgroundTask, Context, Scheduler},
};

/// One sweep partition, run every `timer_interval`.
pub struct SweepTask {
    location: Arc<Location>,
    worker: usize,
}

impl SweepTask {
    pub fn new(location: Arc<Location>, worker: usize) -> Self {
        Self { location, worker }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SweepTask {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn interval(&self) -> Duration {
        self.location.config().timer_interval
    }

    /// Workers are spread evenly over the interval.
    fn start_delay(&self) -> Duration {
        let workers = self.location.config().sweep_workers.max(1) as u32;
        self.interval() * self.worker as u32 / workers
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let location = self.location.clone();
        let worker = self.worker;
        // Sweeps take blocking locks and may do storage I/O.
        let report = tokio::task::spawn_blocking(move || location.sweep_worker(worker, unix_now()))
            .await
            .map_err(|e| Error::InvalidState(format!("Sweep join error: {}", e)))?;

        if report.failures > 0 {
            tracing::warn!(
                worker,
                run_id = ctx.run_id,
                failures = report.failures,
                "Sweep finished with failures"
            );
        }
        Ok(())
    }
}

pub struct MetricsTask {
    location: Arc<Location>,
}

impl MetricsTask {
    pub fn new(location: Arc<Location>) -> Self {
        Self { location }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.location.config().metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        metrics::collect_metrics(&self.location)
    }
}

/// Starts one sweep task per configured worker plus the metrics task.
/// Must be called from within a tokio runtime.
pub fn start(location: Arc<Location>) -> Scheduler {
    let scheduler = Scheduler::new();
    for worker in 0..location.config().sweep_workers {
        scheduler.register(Arc::new(SweepTask::new(location.clone(), worker)));
    }
    scheduler.register(Arc::new(MetricsTask::new(location)));
    scheduler
}
