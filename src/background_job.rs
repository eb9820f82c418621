use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::schema::JobType;
use crate::storage::{NewJob, Store};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// How a job handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job did its work.
    Completed,
    /// The job found nothing left to do, e.g. because the incident moved on.
    Cancelled(String),
}

impl JobOutcome {
    /// Shorthand for [`JobOutcome::Cancelled`].
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }
}

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type of the job.
    ///
    /// This MUST be unique among the jobs registered with an engine.
    const JOB_TYPE: JobType;

    /// Execute the task against the engine.
    ///
    /// Handlers re-check current state before acting and report
    /// [`JobOutcome::Cancelled`] when the work became moot.
    fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &Engine<S, D, C>,
    ) -> impl Future<Output = anyhow::Result<JobOutcome>> + Send;

    /// Enqueue this job to run at `scheduled_at`.
    ///
    /// Returns the job ID.
    #[instrument(name = "jobs.enqueue", skip(self, engine), fields(job.type = %Self::JOB_TYPE))]
    fn enqueue_at<'a, S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &'a Engine<S, D, C>,
        scheduled_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<i64, EngineError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(err.into()) }.boxed(),
        };
        let max_attempts = engine.config().default_max_attempts;

        engine
            .schedule_job(Self::JOB_TYPE, scheduled_at, payload, max_attempts)
            .boxed()
    }
}

/// Build the queue row for `job`, for insertion inside a store transaction.
pub(crate) fn new_job<J: BackgroundJob>(
    job: &J,
    scheduled_at: DateTime<Utc>,
    max_attempts: i32,
) -> Result<NewJob, serde_json::Error> {
    Ok(NewJob {
        job_type: J::JOB_TYPE,
        payload: serde_json::to_value(job)?,
        max_attempts,
        scheduled_at,
    })
}
