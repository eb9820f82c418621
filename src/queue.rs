//! Durable job queue operations.

use crate::background_job::JobOutcome;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::schema::{BackgroundJob, JobStats, JobStatus, JobType};
use crate::storage::{NewJob, Store};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

/// Delay before retrying a job whose `attempts`-th attempt failed: `base * 2^attempts`.
pub fn backoff_delay(base: Duration, attempts: i32) -> chrono::Duration {
    let exponent = u32::try_from(attempts).unwrap_or(0);
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    chrono::Duration::from_std(base.saturating_mul(factor)).unwrap_or(chrono::Duration::MAX)
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Insert a `PENDING` job that becomes claimable at `scheduled_at`.
    #[instrument(name = "jobs.schedule", skip(self, payload), fields(job.type = %job_type))]
    pub async fn schedule_job(
        &self,
        job_type: JobType,
        scheduled_at: DateTime<Utc>,
        payload: Value,
        max_attempts: i32,
    ) -> Result<i64, EngineError> {
        let now = self.now();
        let job = NewJob {
            job_type,
            payload,
            max_attempts: max_attempts.max(1),
            scheduled_at,
        };

        let id = self.store().insert_job(&job, now).await?;
        debug!(job.id = id, "Scheduled job");
        Ok(id)
    }

    /// Look up a job by id.
    pub async fn get_job(&self, id: i64) -> Result<BackgroundJob, EngineError> {
        self.store()
            .get_job(id)
            .await?
            .ok_or(EngineError::JobNotFound(id))
    }

    /// Claim up to `limit` due jobs for this caller.
    ///
    /// Concurrent callers never receive the same job.
    #[instrument(name = "jobs.claim", skip(self))]
    pub async fn claim_pending_jobs(&self, limit: i64) -> Result<Vec<BackgroundJob>, EngineError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let now = self.now();
        let jobs = self.store().claim_pending_jobs(limit, now).await?;
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Claimed jobs");
        }
        Ok(jobs)
    }

    /// Run a claimed job through its handler and record the outcome.
    ///
    /// Handler errors and panics are recorded through [`Self::mark_job_failed`];
    /// only store errors are returned. While the handler runs, the claim is
    /// renewed every [`EngineConfig::job_heartbeat_interval`](crate::EngineConfig::job_heartbeat_interval)
    /// so the job is not requeued as stale.
    ///
    /// Returns the status the job ended up in. If the claim was lost to a
    /// requeue in the meantime, the outcome is dropped and the job's current
    /// status is returned instead.
    pub async fn process_job(&self, job: BackgroundJob) -> Result<JobStatus, EngineError> {
        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);
        let job_id = job.id;
        let attempt = job.attempts;
        let job_type = job.job_type;

        let engine = self.clone();
        let future = with_sentry_transaction(job_type.as_str(), move || async move {
            let run_task_fn = engine
                .job_registry()
                .get(job_type)
                .ok_or_else(|| anyhow!("Unknown job type {job_type}"))?;

            AssertUnwindSafe(run_task_fn(engine.clone(), job.payload))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        });

        debug!(parent: &span, "Running job…");
        let future = future.instrument(span.clone()).bind_hub(Hub::current());
        let result = self.with_heartbeat(job_id, attempt, future).await;

        async {
            let recorded = match result {
                Ok(JobOutcome::Completed) => {
                    debug!("Job completed");
                    self.mark_job_completed(job_id, attempt)
                        .await?
                        .then_some(JobStatus::Completed)
                }
                Ok(JobOutcome::Cancelled(reason)) => {
                    info!(%reason, "Job cancelled");
                    self.mark_job_cancelled(job_id, attempt, &reason)
                        .await?
                        .then_some(JobStatus::Cancelled)
                }
                Err(error) => {
                    warn!("Failed to run job: {error:#}");
                    self.mark_job_failed(job_id, attempt, &format!("{error:#}"))
                        .await?
                }
            };

            match recorded {
                Some(status) => Ok(status),
                None => {
                    let current = self.get_job(job_id).await?;
                    warn!(
                        status = ?current.status,
                        attempts = current.attempts,
                        "Claim on the job was lost before its outcome was recorded"
                    );
                    Ok(current.status)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Drive `task` while renewing claim `attempt` on job `id`.
    async fn with_heartbeat<F: Future>(&self, id: i64, attempt: i32, task: F) -> F::Output {
        let mut task = pin!(task);
        tokio::select! {
            output = &mut task => output,
            () = self.keep_alive(id, attempt) => task.await,
        }
    }

    /// Renew the claim until it is lost or cannot be renewed.
    async fn keep_alive(&self, id: i64, attempt: i32) {
        let mut ticker = tokio::time::interval(self.config().job_heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.store().touch_job(id, attempt, self.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job.id = id, "Claim on the job was lost, stopping its heartbeat");
                    return;
                }
                Err(error) => {
                    warn!(job.id = id, "Failed to renew the claim on the job: {error}");
                }
            }
        }
    }

    /// Retire a job held under claim `attempt` as `COMPLETED`.
    ///
    /// `attempt` is the job's `attempts` as returned by the claim. Returns
    /// `false` if the job is not `PROCESSING` under that claim, because it was
    /// retired already or requeued and claimed again.
    pub async fn mark_job_completed(&self, id: i64, attempt: i32) -> Result<bool, EngineError> {
        let now = self.now();
        Ok(self.store().complete_job(id, attempt, now).await?)
    }

    /// Retire a job held under claim `attempt` as `CANCELLED`, keeping
    /// `reason` as its error.
    pub async fn mark_job_cancelled(
        &self,
        id: i64,
        attempt: i32,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        Ok(self.store().cancel_job(id, attempt, reason, now).await?)
    }

    /// Record a failed attempt of a job held under claim `attempt`.
    ///
    /// The job becomes `FAILED` once its attempts are exhausted; otherwise it
    /// returns to `PENDING` after the exponential backoff. Returns the new
    /// status, or `None` if the claim is no longer held.
    #[instrument(name = "jobs.fail", skip(self, error))]
    pub async fn mark_job_failed(
        &self,
        id: i64,
        attempt: i32,
        error: &str,
    ) -> Result<Option<JobStatus>, EngineError> {
        let now = self.now();
        let status = self
            .store()
            .fail_job(id, attempt, error, now, self.config().job_backoff_base)
            .await?;

        if status == Some(JobStatus::Failed) {
            warn!(job.id = id, "Job exhausted its attempts");
        }
        Ok(status)
    }

    /// Job counts per status.
    pub async fn get_job_stats(&self) -> Result<JobStats, EngineError> {
        Ok(self.store().job_stats().await?)
    }

    /// Return jobs stuck in `PROCESSING` for longer than `timeout` to the queue.
    ///
    /// Running jobs renew their claim, so a job only stays untouched that long
    /// when its worker died; jobs without attempts left are marked `FAILED`
    /// instead.
    #[instrument(name = "jobs.requeue_stale", skip(self))]
    pub async fn requeue_stale_jobs(&self, timeout: Duration) -> Result<u64, EngineError> {
        let now = self.now();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let stale_before = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let count = self.store().requeue_stale_jobs(stale_before, now).await?;
        if count > 0 {
            warn!(count, "Requeued stale jobs");
        }
        Ok(count)
    }
}
