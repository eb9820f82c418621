use crate::background_job::{BackgroundJob, JobOutcome};
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::schema::JobType;
use crate::storage::Store;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type RunTaskFn<S, D, C> =
    dyn Fn(Engine<S, D, C>, Value) -> BoxFuture<'static, anyhow::Result<JobOutcome>> + Send + Sync;

/// Handlers by job type.
pub(crate) struct JobRegistry<S, D, C> {
    entries: HashMap<JobType, Arc<RunTaskFn<S, D, C>>>,
}

impl<S, D, C> Default for JobRegistry<S, D, C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<S, D, C> Clone for JobRegistry<S, D, C> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<S, D, C> std::fmt::Debug for JobRegistry<S, D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: Store, D: Dispatcher, C: Clock> JobRegistry<S, D, C> {
    pub(crate) fn register<J: BackgroundJob>(&mut self) {
        let run_task_fn: Arc<RunTaskFn<S, D, C>> = Arc::new(|engine: Engine<S, D, C>, payload: Value| {
            async move {
                let job: J = serde_json::from_value(payload)?;
                job.run(&engine).await
            }
            .boxed()
        });

        self.entries.insert(J::JOB_TYPE, run_task_fn);
    }

    pub(crate) fn get(&self, job_type: JobType) -> Option<&Arc<RunTaskFn<S, D, C>>> {
        self.entries.get(&job_type)
    }
}
