use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::storage::Store;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, trace};

pub(crate) struct Worker<S, D, C> {
    pub(crate) engine: Engine<S, D, C>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) batch_size: i64,
}

impl<S: Store, D: Dispatcher, C: Clock> Worker<S, D, C> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run background jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_batch().await {
                Ok(0) if self.shutdown_when_queue_empty => {
                    debug!("No pending background jobs found. Shutting down the worker…");
                    break;
                }
                Ok(0) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending background jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Ok(_) => {}
                Err(error) => {
                    error!("Failed to claim jobs: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim the next batch of due jobs and run them one after another.
    ///
    /// Returns the number of jobs claimed. A job whose outcome could not be
    /// recorded stays `PROCESSING` until the reaper returns it to the queue.
    async fn run_next_batch(&self) -> anyhow::Result<usize> {
        trace!("Looking for due background jobs…");
        let jobs = self.engine.claim_pending_jobs(self.batch_size).await?;
        let count = jobs.len();

        for job in jobs {
            let job_id = job.id;
            if let Err(error) = self.engine.process_job(job).await {
                error!(job.id = job_id, "Failed to record job outcome: {error}");
            }
        }

        Ok(count)
    }
}
