//! Periodic background tasks on the tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::{Error, Result};

/// Passed to every run of a task.
pub struct Context {
    pub task_name: &'static str,
    /// Starts at 1 and counts every run, failed or not.
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// Delay before the first run. Tasks sharing an interval use it to
    /// spread their runs over the period.
    fn start_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// A failed run is logged and the task keeps its schedule.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

struct Registered {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Runs registered tasks on fixed intervals until shut down.
pub struct Scheduler {
    tasks: Mutex<Vec<Registered>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts `task` on its interval. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        tracing::info!(
            task = task.name(),
            interval = ?task.interval(),
            start_delay = ?task.start_delay(),
            "Task registered"
        );
        let name = task.name();
        let handle = self.run_periodic(task);
        self.tasks.lock().push(Registered { name, handle });
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn run_periodic<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + task.start_delay(), task.interval());
            // A slow sweep must not be followed by a burst of catch-up runs.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut run_id = 0u64;
            let mut failures = 0u64;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };
                        if let Err(e) = task.execute(ctx).await {
                            failures += 1;
                            tracing::error!(task = task.name(), run_id, error = %e, "Task run failed");
                        }
                    }
                }
            }
            tracing::info!(task = task.name(), runs = run_id, failures, "Task stopped");
        })
    }

    /// Signals every task and waits for all of them. Returns the first join
    /// error, after every task has been awaited.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut first_err = None;
        for Registered { name, handle } in tasks {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Task did not stop cleanly");
                first_err.get_or_insert(Error::InvalidState(format!("task {name}: {e}")));
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        fn start_delay(&self) -> Duration {
            self.delay
        }

        async fn execute(&self, ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState(format!("run {} failed", ctx.run_id)));
            }
            Ok(())
        }
    }

    fn counting(delay: Duration, fail: bool) -> (Arc<Counting>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(Counting {
            runs: runs.clone(),
            delay,
            fail,
        });
        (task, runs)
    }

    /// Lets spawned tasks observe the advanced clock.
    async fn advance(by: Duration) {
        time::advance(by).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(Duration::ZERO, false);
        scheduler.register(task);
        assert_eq!(scheduler.task_count(), 1);

        advance(Duration::from_millis(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        advance(Duration::from_secs(10)).await;
        advance(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delay_offsets_first_run() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(Duration::from_secs(5), false);
        scheduler.register(task);

        advance(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        advance(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_keeps_running() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(Duration::ZERO, true);
        scheduler.register(task);

        advance(Duration::from_millis(1)).await;
        advance(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_runs_after_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, runs) = counting(Duration::ZERO, false);
        scheduler.register(task);
        advance(Duration::from_millis(1)).await;

        scheduler.shutdown().await?;
        let stopped_at = runs.load(Ordering::SeqCst);
        advance(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), stopped_at);
        Ok(())
    }
}
