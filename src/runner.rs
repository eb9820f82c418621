use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::reaper::Reaper;
use crate::storage::Store;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_NUM_WORKERS: usize = 1;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_BATCH_SIZE: i64 = 10;
const DEFAULT_STALE_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// The core runner responsible for claiming and running jobs
pub struct Runner<S, D, C> {
    engine: Engine<S, D, C>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    batch_size: i64,
    stale_job_timeout: Option<Duration>,
    shutdown_when_queue_empty: bool,
}

impl<S, D, C> std::fmt::Debug for Runner<S, D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("batch_size", &self.batch_size)
            .field("stale_job_timeout", &self.stale_job_timeout)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<S: Store, D: Dispatcher, C: Clock> Runner<S, D, C> {
    /// Create a new runner processing the jobs of `engine`.
    pub fn new(engine: Engine<S, D, C>) -> Self {
        Self {
            engine,
            num_workers: DEFAULT_NUM_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            batch_size: DEFAULT_BATCH_SIZE,
            stale_job_timeout: Some(DEFAULT_STALE_JOB_TIMEOUT),
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of concurrent workers.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how many jobs a worker claims at once.
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set after how long a `PROCESSING` job is considered abandoned, or
    /// `None` to never reap.
    pub fn stale_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stale_job_timeout = timeout;
        self
    }

    /// Set the runner to shut down when no job is due.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                engine: self.engine.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                batch_size: self.batch_size,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        let reaper = self.stale_job_timeout.map(|stale_job_timeout| {
            Reaper {
                engine: self.engine.clone(),
                interval: (stale_job_timeout / 2).max(MIN_REAP_INTERVAL),
                stale_job_timeout,
            }
            .start()
        });

        RunHandle { handles, reaper }
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    reaper: Option<AbortHandle>,
}

impl RunHandle {
    /// Wait for all background workers to shut down, then stop the reaper.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });

        if let Some(reaper) = self.reaper {
            reaper.abort();
        }
    }
}
