use crate::background_job::BackgroundJob;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, LogDispatcher};
use crate::job_registry::JobRegistry;
use crate::jobs::{
    AutoUnsnoozeJob, EscalationStepJob, NotificationJob, ScheduledTask, SlaBreachCheckJob,
};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Entry point of the incident engine.
///
/// Bundles the store, the notification dispatcher, the clock and the
/// handlers of the built-in job types. Cloning is cheap and clones share all
/// of them.
pub struct Engine<S, D = LogDispatcher, C = SystemClock> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    clock: Arc<C>,
    config: Arc<EngineConfig>,
    job_registry: Arc<JobRegistry<S, D, C>>,
}

impl<S, D, C> Clone for Engine<S, D, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            job_registry: self.job_registry.clone(),
        }
    }
}

impl<S, D, C> std::fmt::Debug for Engine<S, D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("job_registry", &self.job_registry)
            .finish_non_exhaustive()
    }
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Create an engine with the default [`EngineConfig`].
    pub fn new(store: S, dispatcher: D, clock: C) -> Self {
        Self::with_config(store, dispatcher, clock, EngineConfig::default())
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(store: S, dispatcher: D, clock: C, config: EngineConfig) -> Self {
        let mut job_registry = JobRegistry::default();
        job_registry.register::<EscalationStepJob>();
        job_registry.register::<AutoUnsnoozeJob>();
        job_registry.register::<NotificationJob>();
        job_registry.register::<SlaBreachCheckJob>();
        job_registry.register::<ScheduledTask>();

        Self {
            store: Arc::new(store),
            dispatcher: Arc::new(dispatcher),
            clock: Arc::new(clock),
            config: Arc::new(config),
            job_registry: Arc::new(job_registry),
        }
    }

    /// Run jobs of type `J::JOB_TYPE` with `J`'s handler instead of the built-in one.
    ///
    /// Must be called before the engine is cloned; clones taken earlier keep
    /// the previous handlers.
    pub fn register_job_type<J: BackgroundJob>(mut self) -> Self {
        Arc::make_mut(&mut self.job_registry).register::<J>();
        self
    }

    #[allow(missing_docs)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[allow(missing_docs)]
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    #[allow(missing_docs)]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn job_registry(&self) -> &JobRegistry<S, D, C> {
        &self.job_registry
    }

    /// Read the clock. Callers read it once per logical operation.
    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
